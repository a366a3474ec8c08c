use lazy_static::lazy_static;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    pub static ref WORKER_IDLE: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("remux_worker_idle", "Whether a worker is idle (1) or busy (0)"),
            &["worker"],
        )
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    pub static ref WORKER_PAUSED: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("remux_worker_paused", "Whether a worker is paused"),
            &["worker"],
        )
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    pub static ref PENDING_TASKS: IntGauge = {
        let gauge = IntGauge::new("remux_pending_tasks", "Tasks waiting for a worker").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    pub static ref PROCESSED_TASKS: IntGauge = {
        let gauge = IntGauge::new(
            "remux_processed_tasks",
            "Tasks waiting for the post-processor",
        )
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
}

pub fn register_all() -> Registry {
    REGISTRY.clone()
}
