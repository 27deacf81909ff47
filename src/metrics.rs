use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::System;
use tokio::sync::mpsc;
use tracing::error;

const REPORT_FILE: &str = "serverMonitorReport.txt";
const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Threadsafe monotonic counter for long running counts.
pub struct Counter {
    count: AtomicU64,
    start: Mutex<Instant>,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            count: AtomicU64::new(0),
            start: Mutex::new(Instant::now()),
        }
    }

    pub fn add(&self, units: u64) {
        self.count.fetch_add(units, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        *self.start.lock().expect("counter lock") = Instant::now();
    }

    pub fn start_time(&self) -> Instant {
        *self.start.lock().expect("counter lock")
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new()
    }
}

/// Controls how a monitor formats itself in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorType {
    Count,
    Percent,
    MegaBytes,
}

/// Controls how samples are accumulated into coarser buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAccumulation {
    Cumulative,
    Average,
}

/// Shifts the ring one slot right (dropping the oldest), writes `new_val` at
/// index 0, and returns the ring sum or mean depending on the mode.
fn rotate_and_accumulate(ring: &mut [f64], new_val: f64, acc: MonitorAccumulation) -> f64 {
    let mut total = 0.0;
    for i in (1..ring.len()).rev() {
        ring[i] = ring[i - 1];
        total += ring[i];
    }
    ring[0] = new_val;
    total += new_val;
    match acc {
        MonitorAccumulation::Cumulative => total,
        MonitorAccumulation::Average => total / ring.len() as f64,
    }
}

fn accumulate(ring: &[f64], acc: MonitorAccumulation) -> f64 {
    let total: f64 = ring.iter().sum();
    match acc {
        MonitorAccumulation::Cumulative => total,
        MonitorAccumulation::Average => total / ring.len() as f64,
    }
}

struct Rings {
    minutes: [f64; 60],
    hours: [f64; 24],
    days: [f64; 7],
    weeks: [f64; 4],
    months: [f64; 12],
    last_hour_rotate: Instant,
    last_day_rotate: Instant,
    last_week_rotate: Instant,
    last_month_rotate: Instant,
}

impl Rings {
    fn new(now: Instant) -> Rings {
        Rings {
            minutes: [0.0; 60],
            hours: [0.0; 24],
            days: [0.0; 7],
            weeks: [0.0; 4],
            months: [0.0; 12],
            last_hour_rotate: now,
            last_day_rotate: now,
            last_week_rotate: now,
            last_month_rotate: now,
        }
    }

    /// One minute-tick: rotates the sample into the minute ring and cascades
    /// into coarser tiers whose rotation threshold has elapsed.
    fn tick(&mut self, sample: f64, acc: MonitorAccumulation, now: Instant) {
        let minute_acc = rotate_and_accumulate(&mut self.minutes, sample, acc);

        if now.duration_since(self.last_hour_rotate) > Duration::from_secs(60 * 60) {
            rotate_and_accumulate(&mut self.hours, minute_acc, acc);
            self.last_hour_rotate = now;
        }
        if now.duration_since(self.last_day_rotate) > Duration::from_secs(60 * 60 * 24) {
            let v = accumulate(&self.hours, acc);
            rotate_and_accumulate(&mut self.days, v, acc);
            self.last_day_rotate = now;
        }
        if now.duration_since(self.last_week_rotate) > Duration::from_secs(60 * 60 * 24 * 7) {
            let v = accumulate(&self.days, acc);
            rotate_and_accumulate(&mut self.weeks, v, acc);
            self.last_week_rotate = now;
        }
        if now.duration_since(self.last_month_rotate) > Duration::from_secs(60 * 60 * 24 * 28) {
            let v = accumulate(&self.weeks, acc);
            rotate_and_accumulate(&mut self.months, v, acc);
            self.last_month_rotate = now;
        }
    }
}

fn report_line(kind: MonitorType, values: &[f64]) -> String {
    let fields: Vec<String> = match kind {
        MonitorType::Count => values.iter().map(|v| format!("{:.0}", v)).collect(),
        MonitorType::Percent => values.iter().map(|v| format!("{:.2}", v)).collect(),
        MonitorType::MegaBytes => values
            .iter()
            .map(|v| format!("{}MBs", (*v as u64) / 1_048_576))
            .collect(),
    };
    fields.join(" ")
}

/// Samples a monitor closure every minute and rotates the results out across
/// minute/hour/day/week/month rings.
pub struct MonitorHistory {
    kind: MonitorType,
    rings: Arc<Mutex<Rings>>,
    stop: mpsc::Sender<()>,
}

impl MonitorHistory {
    /// Captures now as the last-rotate instant for every tier and starts the
    /// sampling task. Must be called within a tokio runtime.
    pub fn new(
        kind: MonitorType,
        accumulation: MonitorAccumulation,
        monitor: Box<dyn Fn() -> f64 + Send + Sync>,
    ) -> MonitorHistory {
        let rings = Arc::new(Mutex::new(Rings::new(Instant::now())));
        let (stop, mut stop_rx) = mpsc::channel::<()>(1);

        let task_rings = rings.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
            interval.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sample = monitor();
                        task_rings
                            .lock()
                            .expect("ring lock")
                            .tick(sample, accumulation, Instant::now());
                    }
                    _ = stop_rx.recv() => return,
                }
            }
        });

        MonitorHistory { kind, rings, stop }
    }

    pub fn minutes(&self) -> Vec<f64> {
        self.rings.lock().expect("ring lock").minutes.to_vec()
    }

    pub fn hours(&self) -> Vec<f64> {
        self.rings.lock().expect("ring lock").hours.to_vec()
    }

    pub fn days(&self) -> Vec<f64> {
        self.rings.lock().expect("ring lock").days.to_vec()
    }

    pub fn weeks(&self) -> Vec<f64> {
        self.rings.lock().expect("ring lock").weeks.to_vec()
    }

    pub fn months(&self) -> Vec<f64> {
        self.rings.lock().expect("ring lock").months.to_vec()
    }

    pub fn report<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let rings = self.rings.lock().expect("ring lock");
        writeln!(w, "Minutes: {}", report_line(self.kind, &rings.minutes))?;
        writeln!(w, "Hours:   {}", report_line(self.kind, &rings.hours))?;
        writeln!(w, "Days:    {}", report_line(self.kind, &rings.days))?;
        writeln!(w, "Weeks:   {}", report_line(self.kind, &rings.weeks))?;
        writeln!(w, "Months:  {}", report_line(self.kind, &rings.months))?;
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.stop.try_send(());
    }
}

/// The full metrics pack for a relay server: message counters plus sampled
/// histories for messages, process usage and live client connections.
pub struct Monitors {
    pub message_counter: Arc<Counter>,
    pub total_message_counter: Arc<Counter>,
    pub messages: Arc<MonitorHistory>,
    pub cpu: Arc<MonitorHistory>,
    pub memory: Arc<MonitorHistory>,
    pub client_conns: Arc<MonitorHistory>,
    start_time: Instant,
    reporter_stop: Option<mpsc::Sender<()>>,
}

impl Monitors {
    pub fn start(conn_gauge: Arc<AtomicUsize>, config_dir: &Path, log_to_file: bool) -> Monitors {
        let message_counter = Arc::new(Counter::new());
        let total_message_counter = Arc::new(Counter::new());

        let mc = message_counter.clone();
        let total = total_message_counter.clone();
        let messages = Arc::new(MonitorHistory::new(
            MonitorType::Count,
            MonitorAccumulation::Cumulative,
            Box::new(move || {
                let n = mc.count();
                total.add(n);
                mc.reset();
                n as f64
            }),
        ));

        let sys = Arc::new(Mutex::new(System::new()));
        let pid = sysinfo::get_current_pid().ok();

        let cpu_sys = sys.clone();
        let cpu = Arc::new(MonitorHistory::new(
            MonitorType::Percent,
            MonitorAccumulation::Average,
            Box::new(move || {
                let mut sys = cpu_sys.lock().expect("sysinfo lock");
                pid.and_then(|pid| {
                    sys.refresh_process(pid);
                    sys.process(pid).map(|p| p.cpu_usage() as f64)
                })
                .unwrap_or(0.0)
            }),
        ));

        let mem_sys = sys.clone();
        let memory = Arc::new(MonitorHistory::new(
            MonitorType::MegaBytes,
            MonitorAccumulation::Average,
            Box::new(move || {
                let mut sys = mem_sys.lock().expect("sysinfo lock");
                pid.and_then(|pid| {
                    sys.refresh_process(pid);
                    sys.process(pid).map(|p| p.memory() as f64)
                })
                .unwrap_or(0.0)
            }),
        ));

        let client_conns = Arc::new(MonitorHistory::new(
            MonitorType::Count,
            MonitorAccumulation::Average,
            Box::new(move || conn_gauge.load(Ordering::Relaxed) as f64),
        ));

        let start_time = Instant::now();
        let reporter_stop = if log_to_file {
            let (stop, mut stop_rx) = mpsc::channel::<()>(1);
            let path = config_dir.join(REPORT_FILE);
            let histories = (
                messages.clone(),
                client_conns.clone(),
                cpu.clone(),
                memory.clone(),
            );
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = write_report(&path, start_time, &histories) {
                                error!("could not write monitor report: {}", e);
                            }
                        }
                        _ = stop_rx.recv() => return,
                    }
                }
            });
            Some(stop)
        } else {
            None
        };

        Monitors {
            message_counter,
            total_message_counter,
            messages,
            cpu,
            memory,
            client_conns,
            start_time,
            reporter_stop,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn stop(&self) {
        if let Some(stop) = &self.reporter_stop {
            let _ = stop.try_send(());
        }
        self.messages.stop();
        self.cpu.stop();
        self.memory.stop();
        self.client_conns.stop();
    }
}

fn write_report(
    path: &PathBuf,
    start_time: Instant,
    histories: &(
        Arc<MonitorHistory>,
        Arc<MonitorHistory>,
        Arc<MonitorHistory>,
        Arc<MonitorHistory>,
    ),
) -> io::Result<()> {
    let (messages, client_conns, cpu, memory) = histories;
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);

    writeln!(w, "Uptime: {:?}\n", start_time.elapsed())?;
    writeln!(w, "messages:")?;
    messages.report(&mut w)?;
    writeln!(w, "\nClient Connections:")?;
    client_conns.report(&mut w)?;
    writeln!(w, "\nCPU:")?;
    cpu.report(&mut w)?;
    writeln!(w, "\nMemory:")?;
    memory.report(&mut w)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_add_and_reset() {
        let c = Counter::new();
        c.add(3);
        c.add(2);
        assert_eq!(c.count(), 5);
        let before = c.start_time();
        c.reset();
        assert_eq!(c.count(), 0);
        assert!(c.start_time() >= before);
    }

    #[test]
    fn rotate_shifts_and_sums() {
        let mut ring = [0.0; 4];
        assert_eq!(
            rotate_and_accumulate(&mut ring, 4.0, MonitorAccumulation::Cumulative),
            4.0
        );
        assert_eq!(
            rotate_and_accumulate(&mut ring, 6.0, MonitorAccumulation::Cumulative),
            10.0
        );
        assert_eq!(ring, [6.0, 4.0, 0.0, 0.0]);
        assert_eq!(
            rotate_and_accumulate(&mut ring, 2.0, MonitorAccumulation::Average),
            3.0
        );
        assert_eq!(ring, [2.0, 6.0, 4.0, 0.0]);
    }

    #[test]
    fn minute_ring_holds_latest_sample_first() {
        let now = Instant::now();
        let mut rings = Rings::new(now);
        for i in 0..60 {
            rings.tick(
                i as f64,
                MonitorAccumulation::Cumulative,
                now + Duration::from_secs(60 * (i + 1)),
            );
        }
        assert_eq!(rings.minutes[0], 59.0);
        assert_eq!(rings.minutes[59], 0.0);
        // under an hour: the hour tier must not have advanced
        assert!(rings.hours.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn hour_ring_advances_past_threshold() {
        let now = Instant::now();
        let mut rings = Rings::new(now);
        for i in 0..59 {
            rings.tick(
                1.0,
                MonitorAccumulation::Cumulative,
                now + Duration::from_secs(60 * (i + 1)),
            );
        }
        assert!(rings.hours.iter().all(|v| *v == 0.0));
        // crossing the one hour threshold pushes the minute accumulation down
        rings.tick(
            1.0,
            MonitorAccumulation::Cumulative,
            now + Duration::from_secs(60 * 61),
        );
        assert_eq!(rings.hours[0], 60.0);
    }

    #[test]
    fn megabyte_report_line_scales() {
        let line = report_line(MonitorType::MegaBytes, &[2_097_152.0, 0.0]);
        assert_eq!(line, "2MBs 0MBs");
    }
}
