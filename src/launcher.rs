//! Single-machine launch orchestration.
//!
//! Runs the full master/slave pipeline on one host: start the master,
//! attach a local slave, let the test run for the configured duration,
//! then stop and return the aggregate.

use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::analyse::AnalyseResult;
use crate::errors::EngineError;
use crate::job::JobContainer;
use crate::master::Master;
use crate::settings::Settings;
use crate::slave::Slave;

pub struct Launcher {
    settings: Settings,
    worker_num: Option<usize>,
    duration: Duration,
    jobs: Vec<JobContainer>,
}

impl Launcher {
    pub fn new(settings: Settings, worker_num: Option<usize>, duration: Duration) -> Self {
        Launcher {
            settings,
            worker_num,
            duration,
            jobs: Vec::new(),
        }
    }

    pub fn dispatch(&mut self, job: JobContainer) {
        self.jobs.push(job);
    }

    /// Runs the whole pipeline and returns the aggregate.
    pub fn launch(mut self) -> Result<AnalyseResult, EngineError> {
        assert!(!self.jobs.is_empty(), "launcher needs at least one job");

        // local mode is always exactly one node on this host
        let mut master_settings = self.settings.clone();
        master_settings.slaves = vec!["127.0.0.1".to_string()];
        let mut master = Master::new(master_settings, self.worker_num);
        master.dispatch(std::mem::take(&mut self.jobs));
        let addr = master.start()?;

        let mut slave_settings = self.settings.clone();
        slave_settings.master = "127.0.0.1".to_string();
        slave_settings.master_port = addr.port();
        let node = thread::Builder::new().name("slave".to_string()).spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "slave runtime build failed");
                    return;
                }
            };
            let mut slave = Slave::new(slave_settings);
            if let Err(e) = runtime.block_on(slave.run()) {
                error!(error = %e, "slave terminated abnormally");
            }
        })?;

        info!(duration_secs = self.duration.as_secs(), "test running");
        thread::sleep(self.duration);

        let aggregate = master.stop()?;
        let _ = node.join();
        Ok(aggregate)
    }
}
