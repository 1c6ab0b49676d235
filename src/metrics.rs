//! Prometheus-compatible metrics endpoint
//!
//! Every scheduler registers a [`ManagerStats`] block and updates it from its
//! ticks. The registry renders in Prometheus text format for Grafana
//! dashboards, plus a JSON view.
//! Default endpoint: http://localhost:9090/metrics

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How a manager schedules its subjects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerKind {
    /// Sharded pools, one timer per pool
    Pool,
    /// One shared queue, one timer
    Queue,
    /// Dedicated loop
    Loop,
}

impl ManagerKind {
    fn as_str(&self) -> &'static str {
        match self {
            ManagerKind::Pool => "pool",
            ManagerKind::Queue => "queue",
            ManagerKind::Loop => "loop",
        }
    }
}

/// Counters for one scheduler
#[derive(Debug)]
pub struct ManagerStats {
    name: String,
    kind: ManagerKind,

    // Gauges
    pub subjects: AtomicU64,
    pub pools: AtomicU64,

    // Counters
    pub ticks: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub actions: AtomicU64,
    pub released: AtomicU64,
    pub faults: AtomicU64,
    pub schedule_failures: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
}

impl ManagerStats {
    pub fn new(name: impl Into<String>, kind: ManagerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            subjects: AtomicU64::new(0),
            pools: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            actions: AtomicU64::new(0),
            released: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            schedule_failures: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
        }
    }

    /// Stats block that is not attached to any registry
    pub fn detached(name: impl Into<String>, kind: ManagerKind) -> Arc<Self> {
        Arc::new(Self::new(name, kind))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    /// Record one completed tick and its duration
    pub fn record_tick(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_time_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn set_subjects(&self, count: usize) {
        self.subjects.store(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            subjects: self.subjects.load(Ordering::Relaxed),
            pools: self.pools.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            actions: self.actions.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            schedule_failures: self.schedule_failures.load(Ordering::Relaxed),
            tick_time_us: self.tick_time_us.load(Ordering::Relaxed),
            tick_time_max_us: self.tick_time_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`ManagerStats`]
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub name: String,
    pub kind: ManagerKind,
    pub subjects: u64,
    pub pools: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub actions: u64,
    pub released: u64,
    pub faults: u64,
    pub schedule_failures: u64,
    pub tick_time_us: u64,
    pub tick_time_max_us: u64,
}

#[derive(Debug, Serialize)]
struct MetricsReport {
    uptime_seconds: u64,
    game_ticks: u64,
    is_night: bool,
    managers: Vec<ManagerSnapshot>,
}

/// Metrics registry for the scheduling subsystem
#[derive(Debug)]
pub struct Metrics {
    // Game clock
    pub game_ticks: AtomicU64,
    pub is_night: AtomicU64, // 0 or 1

    // Server uptime
    start_time: Instant,

    managers: RwLock<Vec<Arc<ManagerStats>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            game_ticks: AtomicU64::new(0),
            is_night: AtomicU64::new(0),
            start_time: Instant::now(),
            managers: RwLock::new(Vec::new()),
        }
    }

    /// Register a scheduler and get its stats block
    pub fn register(&self, name: impl Into<String>, kind: ManagerKind) -> Arc<ManagerStats> {
        let stats = Arc::new(ManagerStats::new(name, kind));
        self.managers.write().push(stats.clone());
        stats
    }

    pub fn manager(&self, name: &str) -> Option<Arc<ManagerStats>> {
        self.managers.read().iter().find(|m| m.name() == name).cloned()
    }

    pub fn snapshots(&self) -> Vec<ManagerSnapshot> {
        self.managers.read().iter().map(|m| m.snapshot()).collect()
    }

    /// Total subjects across every scheduler
    pub fn total_subjects(&self) -> u64 {
        self.managers
            .read()
            .iter()
            .map(|m| m.subjects.load(Ordering::Relaxed))
            .sum()
    }

    /// Total pool timers across every pool-based scheduler
    pub fn total_pools(&self) -> u64 {
        self.managers
            .read()
            .iter()
            .map(|m| m.pools.load(Ordering::Relaxed))
            .sum()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);
        let snapshots = self.snapshots();

        // Helper macro for unlabelled metrics
        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // One family per field, one sample per manager
        macro_rules! family {
            ($name:expr, $help:expr, $type:expr, $field:ident) => {
                output.push_str(&format!("# HELP {} {}\n# TYPE {} {}\n", $name, $help, $name, $type));
                for s in &snapshots {
                    output.push_str(&format!(
                        "{}{{manager=\"{}\",kind=\"{}\"}} {}\n",
                        $name,
                        s.name,
                        s.kind.as_str(),
                        s.$field
                    ));
                }
            };
        }

        family!("realm_taskd_subjects", "Subjects currently scheduled", "gauge", subjects);
        family!("realm_taskd_pools", "Pools (and pool timers) created", "gauge", pools);
        family!("realm_taskd_ticks_total", "Ticks executed", "counter", ticks);
        family!("realm_taskd_skipped_ticks_total", "Ticks skipped because the previous one was still running", "counter", skipped_ticks);
        family!("realm_taskd_actions_total", "Terminal actions performed", "counter", actions);
        family!("realm_taskd_released_total", "Subjects released during ticks", "counter", released);
        family!("realm_taskd_faults_total", "Per-subject faults caught", "counter", faults);
        family!("realm_taskd_schedule_failures_total", "Recurring task registrations that failed", "counter", schedule_failures);
        family!("realm_taskd_tick_time_microseconds", "Last tick duration", "gauge", tick_time_us);
        family!("realm_taskd_tick_time_max_microseconds", "Maximum tick duration", "gauge", tick_time_max_us);

        metric!("realm_taskd_game_ticks", "Game clock ticks since start", "counter",
            self.game_ticks.load(Ordering::Relaxed));
        metric!("realm_taskd_is_night", "In-game night (0/1)", "gauge",
            self.is_night.load(Ordering::Relaxed));
        metric!("realm_taskd_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let report = MetricsReport {
            uptime_seconds: self.uptime_seconds(),
            game_ticks: self.game_ticks.load(Ordering::Relaxed),
            is_night: self.is_night.load(Ordering::Relaxed) == 1,
            managers: self.snapshots(),
        };
        serde_json::to_string_pretty(&report).unwrap_or_else(|e| {
            debug!("Failed to serialize metrics: {}", e);
            "{}".to_string()
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
#[cfg(feature = "metrics_http")]
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::info;

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = http_response(&metrics, &request);

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

/// Route a raw HTTP request to a full response
#[cfg_attr(not(feature = "metrics_http"), allow(dead_code))]
fn http_response(metrics: &Metrics, request: &str) -> String {
    // JSON routes first: "GET /metrics/json" also starts with "GET /metrics"
    let (content_type, body) = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
