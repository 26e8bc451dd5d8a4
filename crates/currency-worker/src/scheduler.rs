//! 汇率定时刷新调度
//!
//! 启动时立即拉取一次汇率，之后按 cron 表达式周期调用 `RateManager::fetch_and_store_rates`，
//! 与消费者相互独立。单次刷新失败只记录日志，不会中断调度；`stop` 会等待正在执行的刷新完成。
//! 关闭调度时由 `refresh_once` 完成启动拉取。

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use fx_shared::config::SchedulerConfig;
use fx_shared::error::FxError;
use fx_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::rate_manager::{RateManager, RefreshOutcome};

const WORKER_NAME: &str = "rate_refresh_scheduler";

pub struct RateRefreshScheduler {
    rate_manager: Arc<RateManager>,
    schedule: Schedule,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RateRefreshScheduler {
    /// 按配置创建调度器，cron 表达式非法时返回配置错误
    pub fn new(
        rate_manager: Arc<RateManager>,
        config: &SchedulerConfig,
    ) -> Result<Self, WorkerError> {
        let schedule = Schedule::from_str(&config.cron)
            .map_err(|e| FxError::Config(format!("非法的 cron 表达式 '{}': {e}", config.cron)))?;
        Ok(Self::with_schedule(rate_manager, schedule))
    }

    pub fn with_schedule(rate_manager: Arc<RateManager>, schedule: Schedule) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            rate_manager,
            schedule,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// 给定时间之后的下一次触发时间
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 派生调度任务，任务内先立即刷新一次；已启动时为空操作
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("汇率刷新调度已启动，忽略重复启动");
            return;
        }

        let manager = Arc::clone(&self.rate_manager);
        let schedule = self.schedule.clone();
        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            run(manager, schedule, shutdown_rx).await;
        }));

        info!(
            next_run = ?self.next_run_after(Utc::now()),
            "汇率刷新调度已启动"
        );
    }

    /// 停止调度并等待正在执行的刷新完成
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return;
        };

        self.shutdown_tx.send_replace(true);

        if let Err(e) = handle.await {
            error!(error = %e, "汇率刷新调度任务异常退出");
        }
        info!("汇率刷新调度已停止");
    }
}

async fn run(
    manager: Arc<RateManager>,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
) {
    if !*shutdown.borrow() {
        refresh_once(&manager).await;
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("cron 表达式没有后续触发时间，调度结束");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        refresh_once(&manager).await;
    }
}

/// 执行一次刷新并记录结果，失败不向上传播
pub async fn refresh_once(manager: &RateManager) {
    match manager.fetch_and_store_rates().await {
        Ok(RefreshOutcome::Stored { count }) => {
            info!(count, "汇率刷新完成");
        }
        Ok(RefreshOutcome::Degraded { reason }) => {
            warn!(reason = %reason, "汇率刷新降级，沿用已缓存汇率");
        }
        Err(e) => {
            error!(error = %e, "汇率刷新失败，等待下次刷新");
        }
    }

    metrics::set_worker_last_run(WORKER_NAME);
}
