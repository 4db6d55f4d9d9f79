//! Job control surface
//!
//! Every operation takes a [`JobSelector`]. An `Id` selector that matches
//! nothing fails with [`JobError::NotFound`]; `Tag` and `All` selectors may
//! match zero jobs and succeed. Stop, pause, and resume only set flags that
//! workers observe at their next checkpoint.

use super::{Job, JobError, JobId, JobInfo, JobModification, JobReport, JobSelector, WorkerShared, WorkerStatus};
use crate::config::Config;
use crate::context::IoContext;
use crate::state::ProcessState;
use crate::util::cancel::StopReason;
use crate::worker::{self, barrier::PassBarrier};
use crate::Result;
use anyhow::{anyhow, Context};
use std::sync::Arc;
use tracing::{debug, info};

impl ProcessState {
    /// Clone `template` once per worker, initialize the clones, and launch
    /// the job's threads
    ///
    /// Setup failures (allocation, device parameters) fail the call before
    /// any thread starts. With `start_paused` the workers park at their first
    /// checkpoint until the job is resumed.
    pub fn create_job(&self, config: Arc<Config>, template: &IoContext, start_paused: bool) -> Result<JobId> {
        if self.is_terminating() {
            anyhow::bail!("process is terminating, not starting new jobs");
        }
        let workers = config.worker_count();
        let id = self.jobs.next_id();

        let mut contexts = Vec::with_capacity(workers);
        for thread in 0..workers {
            let mut ctx = IoContext::clone_for_thread(template, thread, thread == 0)
                .with_context(|| format!("job {}: failed to clone context for thread {}", id, thread))?;
            ctx.initialize()
                .with_context(|| format!("job {}: failed to initialize thread {}", id, thread))?;
            contexts.push(ctx);
        }

        let job_token = self.token.child();
        let members: Vec<Arc<WorkerShared>> = contexts
            .iter()
            .map(|ctx| {
                Arc::new(WorkerShared::new(
                    ctx.thread,
                    ctx.name.clone(),
                    ctx.device_name().to_string(),
                    job_token.child(),
                ))
            })
            .collect();
        let barrier = if config.test.barrier && workers > 1 {
            Some(Arc::new(PassBarrier::new(workers)))
        } else {
            None
        };

        let job = Arc::new(Job::new(id, config, job_token, members, barrier));
        job.launch(start_paused);
        self.jobs.insert(Arc::clone(&job));

        for (index, ctx) in contexts.into_iter().enumerate() {
            let member = Arc::clone(&job.members[index]);
            let job_ref = Arc::clone(&job);
            let spawned = std::thread::Builder::new()
                .name(format!("iovet-j{}-{}", id, ctx.name))
                .spawn(move || worker::run_worker(job_ref, member, ctx));

            match spawned {
                Ok(handle) => job.add_handle(index, handle),
                Err(e) => {
                    job.begin_termination(StopReason::User);
                    for member in &job.members[index..] {
                        if member.complete(WorkerStatus::Failure, member.capture_live()) {
                            job.member_finished(member, WorkerStatus::Failure);
                        }
                    }
                    return Err(anyhow!(e).context(format!("job {}: failed to spawn worker {}", id, index)));
                }
            }
        }

        info!(job = id, tag = ?job.tag, workers, paused = start_paused, "job created");
        Ok(id)
    }

    /// Request a cooperative stop. Finished jobs are left alone.
    pub fn stop_job(&self, selector: &JobSelector) -> std::result::Result<usize, JobError> {
        let jobs = self.jobs.select(selector)?;
        for job in &jobs {
            if !job.begin_termination(StopReason::User) {
                debug!(job = job.id, state = %job.state(), "stop: nothing to do");
            }
        }
        Ok(jobs.len())
    }

    pub fn pause_job(&self, selector: &JobSelector) -> std::result::Result<usize, JobError> {
        self.for_each_transition(selector, Job::pause)
    }

    pub fn resume_job(&self, selector: &JobSelector) -> std::result::Result<usize, JobError> {
        self.for_each_transition(selector, Job::resume)
    }

    /// `Id` selectors report an invalid transition; group selectors skip
    /// jobs that cannot make it
    fn for_each_transition(
        &self,
        selector: &JobSelector,
        op: fn(&Job) -> std::result::Result<(), JobError>,
    ) -> std::result::Result<usize, JobError> {
        let jobs = self.jobs.select(selector)?;
        let mut applied = 0;
        for job in &jobs {
            match op(job) {
                Ok(()) => applied += 1,
                Err(e) if matches!(selector, JobSelector::Id(_)) => return Err(e),
                Err(e) => debug!(job = job.id, error = %e, "skipped"),
            }
        }
        Ok(applied)
    }

    /// Forced cancellation: capture statistics and stop waiting for the
    /// workers
    pub fn cancel_job(&self, selector: &JobSelector) -> std::result::Result<usize, JobError> {
        let jobs = self.jobs.select(selector)?;
        for job in &jobs {
            job.begin_termination(StopReason::User);
            job.force_cancel();
        }
        Ok(jobs.len())
    }

    /// Wait for the selected jobs to finish, reap them from the table, and
    /// return their reports
    pub fn wait_job(&self, selector: &JobSelector) -> Result<Vec<JobReport>> {
        let jobs = self.jobs.select(selector)?;
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            job.wait();
            job.join_workers();
            self.jobs.remove(job.id);
            let report = job.report().with_context(|| format!("job {}: failed to build report", job.id))?;
            info!(job = job.id, success = report.success, "job reaped");
            reports.push(report);
        }
        Ok(reports)
    }

    pub fn query_job(&self, selector: &JobSelector) -> std::result::Result<Vec<JobInfo>, JobError> {
        Ok(self.jobs.select(selector)?.iter().map(|job| job.info()).collect())
    }

    /// Adjust monitor settings of running jobs
    pub fn modify_job(
        &self,
        selector: &JobSelector,
        change: &JobModification,
    ) -> std::result::Result<usize, JobError> {
        let jobs = self.jobs.select(selector)?;
        for job in &jobs {
            job.modify(change);
        }
        Ok(jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceKind;
    use crate::job::JobState;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.test.device = DeviceKind::Memory;
        config.test.output = Some("vol".into());
        config.test.size = Some(64 * 512);
        config.test.records = Some(16);
        config.test.seed = Some(1);
        config
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let state = ProcessState::new(false);
        assert_eq!(state.stop_job(&JobSelector::Id(7)), Err(JobError::NotFound(7)));
        assert_eq!(state.pause_job(&JobSelector::Id(7)), Err(JobError::NotFound(7)));
        assert_eq!(state.stop_job(&JobSelector::Tag("none".into())), Ok(0));
    }

    #[test]
    fn test_stop_finished_job_is_noop() {
        let state = ProcessState::new(false);
        let config = Arc::new(memory_config());
        let template = IoContext::from_config(&config).unwrap();
        let id = state.create_job(Arc::clone(&config), &template, false).unwrap();

        let job = state.jobs.get(id).unwrap();
        job.wait();
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(state.stop_job(&JobSelector::Id(id)), Ok(1));
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(job.stop_reason(), None);

        let reports = state.wait_job(&JobSelector::Id(id)).unwrap();
        assert!(reports[0].success);
        assert!(state.jobs.is_empty());
    }

    #[test]
    fn test_query_reports_threads() {
        let state = ProcessState::new(false);
        let mut config = memory_config();
        config.test.threads = 2;
        let config = Arc::new(config);
        let template = IoContext::from_config(&config).unwrap();
        let id = state.create_job(Arc::clone(&config), &template, true).unwrap();

        let info = state.query_job(&JobSelector::Id(id)).unwrap();
        assert_eq!(info[0].state, JobState::Paused);
        assert_eq!(info[0].threads.len(), 2);

        state.resume_job(&JobSelector::All).unwrap();
        let reports = state.wait_job(&JobSelector::All).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].totals.counters.records_written, 32);
    }

    #[test]
    fn test_modify_by_tag() {
        let state = ProcessState::new(false);
        let mut config = memory_config();
        config.test.tag = Some("soak".into());
        let config = Arc::new(config);
        let template = IoContext::from_config(&config).unwrap();
        let id = state.create_job(Arc::clone(&config), &template, true).unwrap();

        let change = JobModification { rate: Some(Some(1 << 20)), ..Default::default() };
        assert_eq!(state.modify_job(&JobSelector::Tag("other".into()), &change), Ok(0));
        assert_eq!(state.modify_job(&JobSelector::Tag("soak".into()), &change), Ok(1));
        assert_eq!(state.jobs.get(id).unwrap().tuning().rate, Some(1 << 20));

        state.resume_job(&JobSelector::All).unwrap();
        state.wait_job(&JobSelector::All).unwrap();
    }

    #[test]
    fn test_setup_failure_starts_nothing() {
        let state = ProcessState::new(false);
        let mut config = memory_config();
        config.test.block_size = 1 << 20;
        config.test.size = Some(4096);
        let config = Arc::new(config);
        let template = IoContext::from_config(&config).unwrap();
        assert!(state.create_job(config, &template, false).is_err());
        assert!(state.jobs.is_empty());
    }
}
