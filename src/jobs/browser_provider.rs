use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::browser::BrowserError;
use crate::scheduler::Job;
use crate::worker::Worker;

/// Hands the worker to the job's browser callback.
///
/// Browser errors raised by the callback are propagated so the worker can
/// retry; any other failure is logged.
pub(crate) async fn run(job: &Job, worker: &mut Worker) -> Result<(), BrowserError> {
    let master = worker.master();
    let Some(callback) = master.callback_for(job.id) else {
        tracing::warn!(job_id = %job.id, "No callback registered for browser lease");
        return Ok(());
    };
    let handler = match master.context().callbacks().resolve_browser(&callback) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Cannot lease browser");
            return Ok(());
        }
    };

    let outcome = AssertUnwindSafe(handler(worker, job.args.clone()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => match e.downcast_ref::<BrowserError>() {
            Some(browser_error) => Err(browser_error.clone()),
            None => {
                tracing::error!(job_id = %job.id, callback = %callback, error = %format!("{:#}", e), "Callback failed");
                Ok(())
            }
        },
        Err(_) => {
            tracing::error!(job_id = %job.id, callback = %callback, "Callback panicked");
            Ok(())
        }
    }
}
