use std::sync::{Arc, RwLock};

use crate::scheduler::job::{Job, JobResult};

pub type JobObserver = Arc<dyn Fn(&Job) + Send + Sync>;
pub type ResultObserver = Arc<dyn Fn(&JobResult) + Send + Sync>;

/// Observer hooks for scheduler events.
///
/// Observers are notified outside the scheduler lock, so they may call back
/// into the scheduler.
#[derive(Default)]
pub struct Observers {
    on_queue: RwLock<Vec<JobObserver>>,
    on_pop: RwLock<Vec<JobObserver>>,
    on_job_done: RwLock<Vec<JobObserver>>,
    on_result: RwLock<Vec<ResultObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_queue(&self, observer: impl Fn(&Job) + Send + Sync + 'static) {
        let observer: JobObserver = Arc::new(observer);
        push(&self.on_queue, observer);
    }

    pub fn on_pop(&self, observer: impl Fn(&Job) + Send + Sync + 'static) {
        let observer: JobObserver = Arc::new(observer);
        push(&self.on_pop, observer);
    }

    pub fn on_job_done(&self, observer: impl Fn(&Job) + Send + Sync + 'static) {
        let observer: JobObserver = Arc::new(observer);
        push(&self.on_job_done, observer);
    }

    pub fn on_result(&self, observer: impl Fn(&JobResult) + Send + Sync + 'static) {
        let observer: ResultObserver = Arc::new(observer);
        push(&self.on_result, observer);
    }

    pub(crate) fn notify_on_queue(&self, job: &Job) {
        notify(&self.on_queue, job);
    }

    pub(crate) fn notify_on_pop(&self, job: &Job) {
        notify(&self.on_pop, job);
    }

    pub(crate) fn notify_on_job_done(&self, job: &Job) {
        notify(&self.on_job_done, job);
    }

    pub(crate) fn notify_on_result(&self, result: &JobResult) {
        notify(&self.on_result, result);
    }

    pub fn clear(&self) {
        clear(&self.on_queue);
        clear(&self.on_pop);
        clear(&self.on_job_done);
        clear(&self.on_result);
    }
}

fn push<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>, observer: Arc<T>) {
    list.write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(observer);
}

fn clear<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) {
    list.write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

fn notify<A: ?Sized>(list: &RwLock<Vec<Arc<dyn Fn(&A) + Send + Sync>>>, arg: &A) {
    // Snapshot so observers registering observers don't deadlock.
    let observers: Vec<_> = list
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    for observer in observers {
        observer(arg);
    }
}
