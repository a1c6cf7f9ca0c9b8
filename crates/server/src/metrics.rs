use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    supersessions: AtomicU64,
    idle_disconnects: AtomicU64,
    broker_messages: AtomicU64,
    pending_rows: AtomicU64,
    tasks_processed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
        self.connections_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_queued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_supersession(&self) {
        self.supersessions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_idle_disconnect(&self) {
        self.idle_disconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_broker_message(&self) {
        self.broker_messages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_pending_row(&self) {
        self.pending_rows.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_task(&self) {
        self.tasks_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE courier_connections_active gauge\ncourier_connections_active {}\n# TYPE courier_connections_total counter\ncourier_connections_total {}\n# TYPE courier_frames_ingress counter\ncourier_frames_ingress {}\n# TYPE courier_frames_egress counter\ncourier_frames_egress {}\n# TYPE courier_delivered counter\ncourier_delivered {}\n# TYPE courier_queued counter\ncourier_queued {}\n# TYPE courier_dropped counter\ncourier_dropped {}\n# TYPE courier_supersessions counter\ncourier_supersessions {}\n# TYPE courier_idle_disconnects counter\ncourier_idle_disconnects {}\n# TYPE courier_broker_messages counter\ncourier_broker_messages {}\n# TYPE courier_pending_rows counter\ncourier_pending_rows {}\n# TYPE courier_tasks_processed counter\ncourier_tasks_processed {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.connections_total.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.delivered.load(Ordering::SeqCst),
            self.queued.load(Ordering::SeqCst),
            self.dropped.load(Ordering::SeqCst),
            self.supersessions.load(Ordering::SeqCst),
            self.idle_disconnects.load(Ordering::SeqCst),
            self.broker_messages.load(Ordering::SeqCst),
            self.pending_rows.load(Ordering::SeqCst),
            self.tasks_processed.load(Ordering::SeqCst),
        )
    }
}
