use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burstprobe::arbiter::SharedChannelArbiter;
use burstprobe::config::{ReceiveMode, SocketConfig};
use burstprobe::models::domain::TrialResult;
use burstprobe::receiver::ReceiveChannel;
use burstprobe::stats::StatsAggregator;
use burstprobe::trial::WorkerPool;

fn loopback_config() -> SocketConfig {
    SocketConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        broadcast: false,
        recv_timeout: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(200),
        mode: ReceiveMode::Shared,
        ..SocketConfig::default()
    }
}

#[test]
fn shared_workers_count_every_datagram() {
    const DATAGRAMS: usize = 200;
    const SIZE: usize = 512;

    let config = loopback_config();
    let arbiter = Arc::new(SharedChannelArbiter::bind(&config).unwrap());
    let target = arbiter.local_addr();
    let stats = StatsAggregator::new();
    let pool = WorkerPool::spawn(4, &ReceiveChannel::Shared(arbiter.clone()), &config, &stats);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..DATAGRAMS {
        sender.send_to(&[0xAB; SIZE], target).unwrap();
        thread::sleep(Duration::from_micros(200));
    }
    thread::sleep(Duration::from_millis(300));

    let summary = pool.shutdown(Duration::from_secs(2));
    assert!(summary.abandoned.is_empty());

    let records = stats.snapshot();
    let trial = TrialResult::from_bursts(4, Duration::from_secs(1), records);
    assert_eq!(trial.total_packets, DATAGRAMS);
    assert_eq!(trial.total_bytes, DATAGRAMS * SIZE);
    assert!(trial.has_signal());
    for record in &trial.burst_records {
        assert!(record.end_time >= record.start_time);
        assert!(record.packet_count >= 1);
        assert!((1..=4).contains(&record.worker_id));
    }
    assert!(arbiter.stats().attempts > 0);
}

#[test]
fn silence_yields_no_bursts() {
    let config = loopback_config();
    let arbiter = Arc::new(SharedChannelArbiter::bind(&config).unwrap());
    let stats = StatsAggregator::new();
    let pool = WorkerPool::spawn(2, &ReceiveChannel::Shared(arbiter), &config, &stats);
    thread::sleep(Duration::from_millis(100));
    pool.shutdown(Duration::from_secs(2));
    assert!(stats.is_empty());
}
