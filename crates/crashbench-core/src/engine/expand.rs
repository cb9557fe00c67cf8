use crate::errors::BenchError;
use crate::model::{Job, JobKind, Scenario};
use crate::sources::GenerationContext;

/// Expands `scenario` into jobs, `n_tries` times over the job list, handing
/// each one to `emit` as soon as it exists. Returning an error from `emit`
/// stops the expansion.
pub fn expand_jobs<F>(scenario: &Scenario, seed: Option<u64>, mut emit: F) -> Result<(), BenchError>
where
    F: FnMut(Job) -> Result<(), BenchError>,
{
    let kinds = scenario
        .jobs
        .iter()
        .map(|j| j.kind())
        .collect::<Result<Vec<_>, _>>()?;

    for nth_try in 0..scenario.n_tries {
        for (nth_job, (spec, kind)) in scenario.jobs.iter().zip(&kinds).enumerate() {
            match kind {
                JobKind::Statement { sql, repeat } => {
                    for index in 0..repeat.unwrap_or(1) {
                        emit(Job {
                            name: spec.name.clone(),
                            index,
                            sql: sql.clone(),
                            crash_test: spec.crash_test,
                        })?;
                    }
                }
                JobKind::Generated(source) => {
                    let mut ctx = GenerationContext::new(nth_try, nth_job, seed);
                    let mut index = 0;
                    source.generate(&mut ctx, &mut |generated| {
                        let job = Job {
                            name: spec.name.clone(),
                            index,
                            sql: generated.sql,
                            crash_test: generated.crash_test.or(spec.crash_test),
                        };
                        index += 1;
                        emit(job)
                    })?;
                }
            }
        }
    }
    Ok(())
}
