#![forbid(unsafe_code)]

use anyhow::Context as _;
use huddle_protocol::AgentJob;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::debug;

/// Queue boundary between the dispatcher and the worker process. The
/// dispatcher returns as soon as the job is enqueued; results arrive
/// later as relay frames, potentially from a different process.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
	/// Enqueue a job, returning its id.
	async fn enqueue(&self, job: AgentJob) -> anyhow::Result<String>;
}

/// Redis list queue. The worker consumes with `BRPOP`.
#[derive(Clone)]
pub struct RedisJobQueue {
	conn: redis::aio::ConnectionManager,
	queue: String,
}

impl RedisJobQueue {
	pub async fn connect(url: &str, queue: String) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("open redis client")?;
		let conn = redis::aio::ConnectionManager::new(client)
			.await
			.context("connect job queue")?;
		Ok(Self { conn, queue })
	}
}

#[async_trait::async_trait]
impl JobQueue for RedisJobQueue {
	async fn enqueue(&self, job: AgentJob) -> anyhow::Result<String> {
		let job_id = job.job_id.clone();
		let payload = serde_json::to_string(&job).context("serialize job")?;

		let mut conn = self.conn.clone();
		let _: () = conn.lpush(&self.queue, payload).await.context("lpush job")?;

		metrics::counter!("huddle_server_jobs_enqueued_total").increment(1);
		debug!(job_id = %job_id, queue = %self.queue, "agent job enqueued");
		Ok(job_id)
	}
}

/// In-memory queue for dev mode and tests; jobs are held until drained.
#[derive(Default)]
pub struct MemoryJobQueue {
	jobs: Mutex<Vec<AgentJob>>,
}

impl MemoryJobQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Take all queued jobs (test hook / dev inspection).
	pub async fn drain(&self) -> Vec<AgentJob> {
		let mut jobs = self.jobs.lock().await;
		std::mem::take(&mut *jobs)
	}
}

#[async_trait::async_trait]
impl JobQueue for MemoryJobQueue {
	async fn enqueue(&self, job: AgentJob) -> anyhow::Result<String> {
		let job_id = job.job_id.clone();
		let mut jobs = self.jobs.lock().await;
		jobs.push(job);
		metrics::counter!("huddle_server_jobs_enqueued_total").increment(1);
		Ok(job_id)
	}
}
