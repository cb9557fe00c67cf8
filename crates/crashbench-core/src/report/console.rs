use crate::stats::LatencyStat;
use std::io::Write;

pub fn write_latency_report<W: Write>(
    w: &mut W,
    stats: &[(String, LatencyStat)],
) -> std::io::Result<()> {
    for (name, s) in stats {
        writeln!(w, "{}:", name)?;
        writeln!(w, "  Median: {:.3}s", s.median)?;
        writeln!(w, "    Mean: {:.3}s", s.mean)?;
        writeln!(w, " 90%tile: {:.3}s", s.p90)?;
        writeln!(w, " 95%tile: {:.3}s", s.p95)?;
        writeln!(w, "     Min: {:.3}s", s.min)?;
        writeln!(w, "     Max: {:.3}s", s.max)?;
    }
    Ok(())
}

pub fn print_latency_report(stats: &[(String, LatencyStat)]) {
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    if let Err(e) = write_latency_report(&mut lock, stats) {
        tracing::warn!(error = %e, "failed to write latency report");
    }
}
