use super::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Probe that replays scripted answers, then repeats the last one.
struct ScriptedProbe {
    answers: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(answers: &[bool]) -> Self {
        Self { answers: Mutex::new(answers.iter().copied().collect()), calls: AtomicUsize::new(0) }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _addr: SocketAddr) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().expect("probe mutex");
        if answers.len() > 1 { answers.pop_front().unwrap_or(false) } else { answers.front().copied().unwrap_or(false) }
    }
}

/// Probe that reports healthy once any racer has won.
struct FlagProbe(Arc<AtomicBool>);

#[async_trait]
impl HealthProbe for FlagProbe {
    async fn probe(&self, _addr: SocketAddr) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral");
    listener.local_addr().expect("local addr")
}

fn settings(addr: SocketAddr) -> ElectionSettings {
    ElectionSettings { addr, settle_delay: Duration::from_millis(20), probe_retries: 3 }
}

#[tokio::test]
async fn healthy_hub_means_client_role() {
    let addr = free_addr().await;
    let probe = ScriptedProbe::new(&[true]);
    let outcome = elect(&probe, &settings(addr)).await.expect("elect");
    assert!(matches!(outcome, Election::Client));
    assert_eq!(probe.calls(), 1);
}

#[tokio::test]
async fn free_port_means_hub_role() {
    let addr = free_addr().await;
    let probe = ScriptedProbe::new(&[false]);
    let Election::Hub(listener) = elect(&probe, &settings(addr)).await.expect("elect") else {
        panic!("expected hub role");
    };
    assert_eq!(listener.local_addr().expect("addr"), addr);
}

#[tokio::test]
async fn lost_bind_race_waits_for_winner() {
    let holder = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = holder.local_addr().expect("addr");
    let probe = ScriptedProbe::new(&[false, false, true]);

    let outcome = elect(&probe, &settings(addr)).await.expect("elect");
    assert!(matches!(outcome, Election::Client));
    assert_eq!(probe.calls(), 3);
}

#[tokio::test]
async fn silent_port_holder_is_unreachable() {
    let holder = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = holder.local_addr().expect("addr");
    let probe = ScriptedProbe::new(&[false]);

    let err = elect(&probe, &settings(addr)).await.expect_err("unreachable");
    assert!(matches!(err, ElectionError::HubUnreachable { attempts: 3, .. }));
    assert_eq!(probe.calls(), 4);
}

#[tokio::test]
async fn other_bind_errors_are_fatal() {
    // TEST-NET-3 is never assigned to a local interface.
    let addr: SocketAddr = "203.0.113.7:47921".parse().expect("addr");
    let probe = ScriptedProbe::new(&[false]);
    let err = elect(&probe, &settings(addr)).await.expect_err("bind fails");
    assert!(matches!(err, ElectionError::Bind { .. }));
}

#[tokio::test]
async fn racing_processes_elect_exactly_one_hub() {
    let addr = free_addr().await;
    let won = Arc::new(AtomicBool::new(false));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let won = Arc::clone(&won);
        tasks.push(tokio::spawn(async move {
            let probe = FlagProbe(Arc::clone(&won));
            let outcome = elect(&probe, &settings(addr)).await;
            if matches!(outcome, Ok(Election::Hub(_))) {
                won.store(true, Ordering::SeqCst);
            }
            outcome
        }));
    }

    let mut hubs = Vec::new();
    let mut clients = 0;
    for task in tasks {
        match task.await.expect("join").expect("elect") {
            Election::Hub(listener) => hubs.push(listener),
            Election::Client => clients += 1,
        }
    }
    assert_eq!(hubs.len(), 1);
    assert_eq!(clients, 4);
}

#[tokio::test]
async fn http_probe_reports_absent_hub() {
    let addr = free_addr().await;
    let probe = HttpHealthProbe::new(Duration::from_millis(200));
    assert!(!probe.probe(addr).await);
}
