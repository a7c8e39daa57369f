use std::sync::Arc;
use std::time::Duration;

use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::background::GenBackgroundService;

use crate::context::{Context, TaskDrain};
use crate::counter::CounterSweeper;
use crate::gateway::Gateway;
use crate::metric::Metrics;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Register the HTTP front on `listen_addr` plus the background services
    /// that sweep counters and drain detached tasks on shutdown.
    pub fn bootstrap(&mut self, ctx: &Context, listen_addr: &str, metrics: Arc<Metrics>) {
        self.server.bootstrap();

        let drain = GenBackgroundService::new(
            "background task drain".to_string(),
            Arc::new(TaskDrain::new(ctx.background.clone())),
        );
        self.server.add_service(drain);

        let sweeper = CounterSweeper::new(
            ctx.counters.clone(),
            metrics.clone(),
            ctx.clock.clone(),
            SWEEP_INTERVAL,
        );
        let sweeper = GenBackgroundService::new("counter sweeper".to_string(), Arc::new(sweeper));
        self.server.add_service(sweeper);

        let mut gateway = http_proxy_service(&self.server.configuration, Gateway::new(ctx, metrics));
        gateway.add_tcp(listen_addr);
        self.server.add_service(gateway);

        log::info!("Gateway listening on {listen_addr}");
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
