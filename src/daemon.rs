// ============================================================================
// SECTION 1: DAEMON
// ============================================================================
// Startup, main loop and shutdown:
// 1. build the registry from the configuration and load the types databases
// 2. load every `LoadPlugin` entry through its module, in file order
// 3. run init callbacks, then start the read scheduler
// 4. sweep the cache for stale entries once per interval until SIGINT,
//    SIGTERM or `shutdown()`
// 5. stop the scheduler, then flush and shut down the plugins
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::adapters::find_module;
use crate::cache::ValueCache;
use crate::config::DaemonConfig;
use crate::error::CollectdResult;
use crate::plugin::{DispatchStatsSnapshot, LogSinks, Registry};
use crate::scheduler::ReadScheduler;
use crate::time::CdTime;
use crate::types::DataSetRegistry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<Registry>,
    scheduler: ReadScheduler,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    started: CdTime,
}

impl Daemon {
    /// Build the registry and load the configured plugins. Errors here end
    /// startup; `CollectdError::exit_code` gives the process status.
    pub fn new(config: DaemonConfig) -> CollectdResult<Self> {
        Self::with_log_sinks(config, LogSinks::new())
    }

    /// Like `new`, sharing `sinks` with the logging layer.
    pub fn with_log_sinks(config: DaemonConfig, sinks: LogSinks) -> CollectdResult<Self> {
        let registry = Arc::new(Registry::with_parts(
            config.settings(),
            DataSetRegistry::with_builtin_types(),
            ValueCache::new(),
            sinks,
        ));
        for path in &config.types_db {
            let count = registry.data_sets().load_types_db(path)?;
            info!(target: "collectd::daemon", path = %path.display(), count, "Types database loaded");
        }

        for entry in &config.load_plugins {
            let module = find_module(&entry.name)?;
            module.load(&registry, config.plugin_block(&entry.name), entry)?;
            debug!(target: "collectd::daemon", plugin = %entry.name, "Plugin loaded");
        }

        let scheduler = ReadScheduler::new(Arc::clone(&registry), config.read_threads);
        Ok(Self {
            config,
            registry,
            scheduler,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            started: CdTime::now(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> CdTime {
        CdTime::now().saturating_sub(self.started)
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.registry.stats()
    }

    /// Ask a running daemon to stop.
    pub fn shutdown(&self) {
        info!(target: "collectd::daemon", "Shutdown requested");
        self.running.store(false, AtomicOrdering::Release);
        self.shutdown.notify_one();
    }

    /// Run until a signal or `shutdown()` arrives, then shut down.
    pub async fn run(&self) -> CollectdResult<()> {
        let settings = self.registry.settings();
        info!(
            target: "collectd::daemon",
            version = VERSION,
            hostname = %settings.hostname,
            interval = %settings.interval,
            plugins = self.config.load_plugins.len(),
            "Starting collectd"
        );

        let failures = self.registry.init_all();
        self.running.store(true, AtomicOrdering::Release);
        let reads = self.scheduler.start();
        info!(target: "collectd::daemon", reads, init_failures = failures, "Initialization complete");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sweep = tokio::time::interval(settings.interval.as_duration());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(AtomicOrdering::Acquire) {
            tokio::select! {
                _ = sweep.tick() => {
                    let expired = self.registry.check_timeouts(CdTime::now());
                    if expired > 0 {
                        debug!(target: "collectd::daemon", expired, "Cache sweep");
                    }
                }
                _ = sigterm.recv() => {
                    info!(target: "collectd::daemon", "Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!(target: "collectd::daemon", "Received SIGINT");
                    break;
                }
                _ = self.shutdown.notified() => {
                    break;
                }
            }
        }
        self.running.store(false, AtomicOrdering::Release);

        info!(target: "collectd::daemon", "Exiting normally");
        self.scheduler.stop().await;
        self.registry.shutdown_all();
        info!(
            target: "collectd::daemon",
            uptime = %self.uptime(),
            stats = ?self.registry.stats(),
            "Shutdown complete"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadPluginConfig;
    use crate::error::{EXIT_CONFIG_ERROR, EXIT_RUNTIME_ERROR};
    use crate::identifier::Identifier;
    use crate::types::{Value, ValueList};
    use std::io::Write;
    use std::time::Duration;

    fn config(plugins: &[&str]) -> DaemonConfig {
        DaemonConfig {
            interval: CdTime::from_millis(50),
            hostname: Some("testhost".to_string()),
            load_plugins: plugins.iter().map(|p| LoadPluginConfig::new(*p)).collect(),
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn test_unknown_plugin_is_a_config_error() {
        let err = Daemon::new(config(&["rrdtool"])).err().unwrap();
        assert_eq!(err.exit_code(), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_missing_types_db_is_a_runtime_error() {
        let mut cfg = config(&[]);
        cfg.types_db.push("/nonexistent/types.db".into());
        let err = Daemon::new(cfg).err().unwrap();
        assert_eq!(err.exit_code(), EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn test_types_db_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# custom types").unwrap();
        writeln!(file, "queue_depth value:GAUGE:0:U").unwrap();
        let mut cfg = config(&[]);
        cfg.types_db.push(file.path().to_path_buf());

        let daemon = Daemon::new(cfg).unwrap();
        assert!(daemon.registry().data_sets().get("queue_depth").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_until_shutdown() {
        let daemon = Arc::new(Daemon::new(config(&["aggregation", "write_log"])).unwrap());
        assert_eq!(daemon.registry().write_names(), vec!["write_log".to_string()]);

        let runner = {
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move { daemon.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(daemon.is_running());

        let vl = ValueList::new(Identifier::new("", "load", "", "load", ""), [
            Value::Gauge(0.1),
            Value::Gauge(0.2),
            Value::Gauge(0.3),
        ]);
        daemon.registry().dispatch_values(vl).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        daemon.shutdown();
        runner.await.unwrap().unwrap();
        assert!(!daemon.is_running());

        let stats = daemon.stats();
        assert_eq!(stats.values_dispatched, 1);
        assert!(stats.reads_executed >= 1);
        assert!(daemon.registry().write_names().is_empty());
    }
}
