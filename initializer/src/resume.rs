use std::{io, time::Duration};

use log::{debug, info};
use tokio::time::Instant;

use crate::{error::Result, group::Collective};

/// An external facility that brings a job back from a checkpoint after interruption.
pub trait ResumeService: Send {
    /// Local setup, it runs between two world barriers.
    fn init(&mut self) -> io::Result<()>;

    /// Whether the job should checkpoint and exit now.
    fn termination_requested(&self) -> bool;

    /// Asks for the job to be relaunched after it exits.
    fn request_resume(&mut self);
}

/// Requests termination once the job ran for a fixed wall clock budget.
#[derive(Debug)]
pub struct DeadlineResume {
    budget: Duration,
    started: Option<Instant>,
    resume_requested: bool,
}

impl DeadlineResume {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: None,
            resume_requested: false,
        }
    }

    pub fn resume_requested(&self) -> bool {
        self.resume_requested
    }
}

impl ResumeService for DeadlineResume {
    fn init(&mut self) -> io::Result<()> {
        self.started = Some(Instant::now());
        info!(budget:? = self.budget; "resume deadline armed");
        Ok(())
    }

    fn termination_requested(&self) -> bool {
        self.started
            .is_some_and(|started| started.elapsed() >= self.budget)
    }

    fn request_resume(&mut self) {
        info!("requesting resume");
        self.resume_requested = true;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumeState {
    #[default]
    NotStarted,
    AwaitingBarrier,
    Ready,
}

/// Tracks whether this worker went through the resume handshake.
#[derive(Debug, Default)]
pub struct ResumeSession {
    state: ResumeState,
}

impl ResumeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResumeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResumeState::Ready
    }

    /// Initializes `service` with every worker of the job in lock step.
    ///
    /// A first barrier waits for every worker to arrive, a second one for every worker to
    /// finish `init`, so none starts working while another is still setting up.
    /// Without a service nothing happens.
    ///
    /// # Errors
    /// Any barrier failure or the service's own init error.
    pub async fn coordinate<C: Collective>(
        &mut self,
        collective: &mut C,
        service: Option<&mut dyn ResumeService>,
    ) -> Result<ResumeState> {
        let Some(service) = service else {
            debug!("no resume service configured");
            return Ok(self.state);
        };

        self.state = ResumeState::AwaitingBarrier;
        collective.barrier().await?;

        service.init()?;

        collective.barrier().await?;
        self.state = ResumeState::Ready;

        Ok(self.state)
    }
}
