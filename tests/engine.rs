//! Engine integration tests: intercepts, TCP and UDP flows, teardown.

mod common;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use common::*;
use tunnelgate::backend::{ConfigType, TunnelCallbacks};
use tunnelgate::config::EngineConfig;
use tunnelgate::engine::Engine;
use tunnelgate::error::{Error, FatalError};
use tunnelgate::intercept::Intercept;
use tunnelgate::stack::packet::{TcpFields, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN};
use tunnelgate::types::{BackendConn, BackendHandle, IoId, Protocol};

const WEB: &str = "10.0.0.1:80";
const DNS: &str = "100.64.0.2:53";

fn web_rule(handle: u64) -> Intercept {
    let mut rule = Intercept::new("web", BackendHandle(handle));
    rule.add_protocol("tcp");
    rule.add_address("10.0.0.0/24").unwrap();
    rule.add_port_range(80, 80);
    rule
}

fn dns_rule(handle: u64) -> Intercept {
    let mut rule = Intercept::new("dns", BackendHandle(handle));
    rule.add_protocol("udp");
    rule.add_address("100.64.0.2").unwrap();
    rule.add_port_range(53, 53);
    rule
}

#[test]
fn test_tcp_connection_lifecycle() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();
    assert_eq!(driver.log.lock().routes_added, vec![net("10.0.0.0/24")]);

    // Nothing is answered until the backend dial completes
    engine.input_packet(&syn(CLIENT, WEB, 1000));
    assert!(driver.take_written().is_empty());

    let dial = backend.last_dial();
    assert_eq!(dial.protocol, Protocol::Tcp);
    assert_eq!(dial.intercept, BackendHandle(1));
    assert_eq!(dial.client.to_string(), CLIENT);
    assert_eq!(dial.intercepted.to_string(), WEB);

    let ctx = engine.io_context(dial.io).unwrap();
    assert_eq!(ctx.client_address(), "tcp:192.168.1.5:40000");
    assert_eq!(ctx.intercepted_address(), "tcp:10.0.0.1:80");
    assert_eq!(ctx.backend_conn(), Some(BackendConn(dial.io.get())));

    engine.dial_completed(dial.io, true);
    let segments = driver.take_segments();
    assert_eq!(segments.len(), 1);
    let syn_ack = &segments[0];
    assert!(syn_ack.has(TCP_SYN | TCP_ACK));
    assert_eq!(syn_ack.ack, 1001);
    assert_eq!(syn_ack.src.to_string(), WEB);
    assert_eq!(syn_ack.dst.to_string(), CLIENT);
    let iss = syn_ack.seq;

    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1001, iss.wrapping_add(1), &[]));
    assert!(driver.take_written().is_empty());
    assert_eq!(engine.ip_stats().connections[0].state, "ESTABLISHED");

    // Client data reaches the backend and is acknowledged
    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK | TCP_PSH, 1001, iss.wrapping_add(1), b"hello"));
    assert_eq!(backend.written_payloads(), vec![b"hello".to_vec()]);
    let ack = driver.take_segments().pop().unwrap();
    assert_eq!(ack.ack, 1006);
    assert_eq!(ack.window, u16::MAX - 5);
    ack_all(&mut engine, &backend);

    // Backend data goes to the client
    assert_eq!(engine.write(dial.io, b"world").unwrap(), 5);
    let data = driver.take_segments().pop().unwrap();
    assert_eq!(data.payload, b"world");
    assert_eq!(data.seq, iss.wrapping_add(1));

    // Backend close sends FIN and releases the context at once
    engine.close(dial.io);
    assert!(engine.io_context(dial.io).is_none());
    let fin = driver.take_segments().pop().unwrap();
    assert!(fin.has(TCP_FIN));
    assert_eq!(fin.seq, iss.wrapping_add(6));

    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1006, iss.wrapping_add(7), &[]));
    engine.input_packet(&tcp(CLIENT, WEB, TCP_FIN | TCP_ACK, 1006, iss.wrapping_add(7), &[]));
    let last = driver.take_segments().pop().unwrap();
    assert_eq!(last.ack, 1007);
    assert_eq!(engine.ip_stats().connections[0].state, "TIME_WAIT");

    engine.process_timeouts(Instant::now() + Duration::from_secs(3));
    let stats = engine.ip_stats();
    assert!(stats.connections.is_empty());
    assert_eq!(stats.pool("tcp_pcb").unwrap().used, 0);
    assert_eq!(stats.io_contexts, 0);
}

#[test]
fn test_window_update_after_backend_ack() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    let (io, iss) = connect(&mut engine, &driver, &backend, CLIENT, WEB);
    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1001, iss.wrapping_add(1), &[0u8; 1460]));
    let ack = driver.take_segments().pop().unwrap();
    assert_eq!(ack.window, u16::MAX - 1460);

    ack_all(&mut engine, &backend);
    let update = driver.take_segments().pop().unwrap();
    assert_eq!(update.window, u16::MAX);
    assert_eq!(update.ack, 1001 + 1460);
    assert!(engine.io_context(io).is_some());
}

#[test]
fn test_client_half_close() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    let (io, iss) = connect(&mut engine, &driver, &backend, CLIENT, WEB);
    let conn = BackendConn(io.get());

    engine.input_packet(&tcp(CLIENT, WEB, TCP_FIN | TCP_ACK, 1001, iss.wrapping_add(1), &[]));
    assert_eq!(backend.log.lock().closed_write, vec![conn]);
    assert_eq!(engine.ip_stats().connections[0].state, "CLOSE_WAIT");

    // The backend may keep writing after the client half-closed
    assert_eq!(engine.write(io, b"late").unwrap(), 4);
    engine.close_write(io).unwrap();
    let fin = driver.take_segments().pop().unwrap();
    assert!(fin.has(TCP_FIN));

    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1002, fin.seq.wrapping_add(1), &[]));
    assert_eq!(backend.log.lock().closed, vec![conn]);
    assert!(engine.io_context(io).is_none());
}

#[test]
fn test_unmatched_syn_is_reset() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    engine.input_packet(&syn(CLIENT, "10.0.0.1:443", 5000));
    let rst = driver.take_segments().pop().unwrap();
    assert!(rst.has(TCP_RST | TCP_ACK));
    assert_eq!(rst.ack, 5001);
    assert!(backend.log.lock().dials.is_empty());
    assert_eq!(engine.ip_stats().counters.dropped, 1);
}

#[test]
fn test_refused_and_failed_dials_reset_client() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    backend.set_refuse(true);
    engine.input_packet(&syn(CLIENT, WEB, 1000));
    let rst = driver.take_segments().pop().unwrap();
    assert!(rst.has(TCP_RST));
    assert_eq!(rst.ack, 1001);
    assert_eq!(engine.ip_stats().io_contexts, 0);

    backend.set_refuse(false);
    engine.input_packet(&syn(CLIENT, WEB, 2000));
    let io = backend.last_dial().io;
    engine.dial_completed(io, false);
    let rst = driver.take_segments().pop().unwrap();
    assert!(rst.has(TCP_RST));
    assert_eq!(rst.ack, 2001);
    assert!(engine.io_context(io).is_none());
    assert!(backend.log.lock().closed.is_empty());
    assert_eq!(engine.ip_stats().pool("tcp_pcb").unwrap().used, 0);
}

#[test]
fn test_newest_rule_wins_on_overlap() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);

    let mut wide = Intercept::new("wide", BackendHandle(1));
    wide.add_protocol("TCP");
    wide.add_address("10.0.0.0/16").unwrap();
    wide.add_port_range(1, 65535);
    engine.intercept(wide).unwrap();

    let mut narrow = Intercept::new("narrow", BackendHandle(2));
    narrow.add_protocol("tcp");
    narrow.add_address("10.0.1.0/24").unwrap();
    narrow.add_port_range(443, 443);
    engine.intercept(narrow).unwrap();

    let order: Vec<&str> = engine.intercepts().map(Intercept::service_name).collect();
    assert_eq!(order, vec!["narrow", "wide"]);

    engine.input_packet(&syn("192.168.1.5:40001", "10.0.1.5:443", 1));
    assert_eq!(backend.last_dial().intercept, BackendHandle(2));

    engine.input_packet(&syn("192.168.1.5:40002", "10.0.2.5:443", 1));
    assert_eq!(backend.last_dial().intercept, BackendHandle(1));

    engine.stop_intercepting(BackendHandle(2));
    engine.input_packet(&syn("192.168.1.5:40003", "10.0.1.5:443", 1));
    assert_eq!(backend.last_dial().intercept, BackendHandle(1));
}

#[test]
fn test_stop_intercepting_closes_connections_and_routes() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);

    let mut rule = web_rule(1);
    rule.add_address("10.9.0.0/16").unwrap();
    rule.add_address("api.internal").unwrap();
    engine.intercept(rule).unwrap();
    assert_eq!(driver.log.lock().routes_added.len(), 2);

    let (io, _) = connect(&mut engine, &driver, &backend, CLIENT, WEB);
    engine.stop_intercepting(BackendHandle(1));

    assert_eq!(backend.log.lock().closed, vec![BackendConn(io.get())]);
    assert!(engine.io_context(io).is_none());
    assert!(driver.take_segments().iter().any(|s| s.has(TCP_RST)));
    assert_eq!(
        driver.log.lock().routes_deleted,
        vec![net("10.0.0.0/24"), net("10.9.0.0/16")]
    );
    assert!(engine.find_intercept(BackendHandle(1)).is_none());

    // The destination is no longer intercepted
    engine.input_packet(&syn("192.168.1.5:40009", WEB, 1));
    assert!(driver.take_segments().pop().unwrap().has(TCP_RST));
}

#[test]
fn test_stop_unknown_handle_is_harmless() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    engine.stop_intercepting(BackendHandle(99));
    assert!(driver.log.lock().routes_deleted.is_empty());
    assert!(engine.find_intercept(BackendHandle(1)).is_some());
}

#[test]
fn test_failed_route_rolls_back() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    driver.log.lock().fail_route = Some(net("10.0.2.0/24"));

    let mut rule = Intercept::new("split", BackendHandle(3));
    rule.add_protocol("tcp");
    rule.add_address("10.0.1.0/24").unwrap();
    rule.add_address("10.0.2.0/24").unwrap();
    rule.add_port_range(22, 22);

    assert!(matches!(engine.intercept(rule), Err(Error::Route(_))));
    let log = driver.log.lock();
    assert_eq!(log.routes_added, vec![net("10.0.1.0/24")]);
    assert_eq!(log.routes_deleted, vec![net("10.0.1.0/24")]);
    drop(log);
    assert_eq!(engine.intercepts().count(), 0);
}

#[test]
fn test_shutdown_closes_everything_and_keeps_routes() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();
    engine.intercept(dns_rule(2)).unwrap();

    connect(&mut engine, &driver, &backend, CLIENT, WEB);
    engine.input_packet(&udp(CLIENT, DNS, b"query"));

    engine.shutdown();
    assert!(!engine.is_running());
    assert_eq!(engine.intercepts().count(), 0);
    assert_eq!(backend.log.lock().closed.len(), 2);
    assert!(driver.log.lock().routes_deleted.is_empty());

    let stats = engine.ip_stats();
    assert_eq!(stats.io_contexts, 0);
    assert!(stats.connections.is_empty());
}

#[test]
fn test_udp_flow_buffers_until_dial_completes() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(dns_rule(2)).unwrap();
    assert_eq!(driver.log.lock().routes_added, vec![net("100.64.0.2/32")]);

    engine.input_packet(&udp(CLIENT, DNS, b"q1"));
    engine.input_packet(&udp(CLIENT, DNS, b"q2"));
    let dial = backend.last_dial();
    assert_eq!(dial.protocol, Protocol::Udp);
    assert_eq!(backend.log.lock().dials.len(), 1);
    assert!(backend.written_payloads().is_empty());
    assert_eq!(engine.ip_stats().connections[0].state, "DIALING");

    engine.dial_completed(dial.io, true);
    assert_eq!(backend.written_payloads(), vec![b"q1".to_vec(), b"q2".to_vec()]);
    ack_all(&mut engine, &backend);

    assert_eq!(engine.write(dial.io, b"answer").unwrap(), 6);
    let (src, dst, payload) = parse_udp(&driver.take_written().pop().unwrap()).unwrap();
    assert_eq!(src.to_string(), DNS);
    assert_eq!(dst.to_string(), CLIENT);
    assert_eq!(payload, b"answer");

    let too_big = vec![0u8; 1500];
    assert!(matches!(
        engine.write(dial.io, &too_big),
        Err(Error::PayloadTooLarge { max: 1472, .. })
    ));

    engine.process_timeouts(Instant::now() + Duration::from_secs(31));
    assert_eq!(backend.log.lock().closed, vec![BackendConn(dial.io.get())]);
    assert!(engine.io_context(dial.io).is_none());
    assert!(matches!(engine.write(dial.io, b"x"), Err(Error::UnknownConnection(_))));

    let stats = engine.ip_stats();
    assert_eq!(stats.pool("udp_pcb").unwrap().used, 0);
    assert_eq!(stats.pool("pbuf_pool").unwrap().used, 0);
}

#[test]
fn test_set_idle_timeout_shortens_expiry() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(dns_rule(2)).unwrap();

    engine.input_packet(&udp(CLIENT, DNS, b"q"));
    let io = backend.last_dial().io;
    engine.set_idle_timeout(io, Duration::from_secs(5)).unwrap();
    assert_eq!(engine.io_context(io).unwrap().idle_timeout(), Duration::from_secs(5));

    let now = Instant::now();
    engine.process_timeouts(now + Duration::from_secs(1));
    assert!(engine.io_context(io).is_some());

    engine.process_timeouts(now + Duration::from_secs(6));
    assert!(engine.io_context(io).is_none());
    assert!(matches!(
        engine.set_idle_timeout(io, Duration::from_secs(1)),
        Err(Error::UnknownConnection(_))
    ));
}

#[test]
fn test_missing_callback_is_fatal() {
    let callbacks = TunnelCallbacks::new().on_dial(|_| None);
    let err = Engine::new(EngineConfig::default(), callbacks, Box::new(RecordingDriver::new()))
        .err()
        .unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err, Error::Fatal(FatalError::MissingCallback("write"))));
}

#[test]
fn test_host_only_engine() {
    let backend = RecordingBackend::new();
    let mut engine = Engine::host_only(EngineConfig::default(), backend.callbacks()).unwrap();

    assert!(matches!(engine.intercept(web_rule(1)), Err(Error::NotInitialized(_))));

    let config = serde_json::json!({ "protocol": "tcp", "address": "localhost", "port": 8080 });
    let context = engine
        .host(BackendHandle(7), "web", ConfigType::HostV1, &config)
        .unwrap();
    assert_eq!(*context.downcast::<u64>().unwrap(), 7);

    let log = backend.log.lock();
    assert_eq!(log.hosted[0].1, "web");
    assert_eq!(log.hosted[0].2, config);
}

#[test]
fn test_exclude_resolved_skips_local_networks() {
    let driver = RecordingDriver::with_exclusion();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);

    let addrs: [IpAddr; 3] = [
        "127.0.0.1".parse().unwrap(),
        "203.0.113.7".parse().unwrap(),
        "2001:db8::1".parse().unwrap(),
    ];
    engine.exclude_resolved("controller.example.com", &addrs);
    assert_eq!(driver.log.lock().excluded, addrs[1..].to_vec());

    let plain = RecordingDriver::new();
    let mut engine = common::engine(&plain, &backend);
    engine.exclude_resolved("controller.example.com", &addrs);
    assert!(plain.log.lock().excluded.is_empty());
}

#[test]
fn test_zero_mss_option_uses_default_segment_size() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();

    let syn = TcpFields {
        seq: 1000,
        ack: 0,
        flags: TCP_SYN,
        window: 65535,
        mss: Some(0),
        payload: &[],
    };
    engine.input_packet(&tcp_with(CLIENT, WEB, &syn));
    let io = backend.last_dial().io;
    engine.dial_completed(io, true);
    let iss = driver.take_segments()[0].seq;
    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1001, iss.wrapping_add(1), &[]));

    assert_eq!(engine.write(io, &[7u8; 1200]).unwrap(), 1200);
    let sizes: Vec<usize> = driver.take_segments().iter().map(|s| s.payload.len()).collect();
    assert_eq!(sizes, vec![536, 536, 128]);
}

/// Establish a connection whose client advertises a zero window.
fn connect_zero_window(engine: &mut Engine, driver: &RecordingDriver, backend: &RecordingBackend) -> (IoId, u32) {
    engine.input_packet(&syn(CLIENT, WEB, 1000));
    let io = backend.last_dial().io;
    engine.dial_completed(io, true);
    let iss = driver.take_segments()[0].seq;

    let ack = TcpFields {
        seq: 1001,
        ack: iss.wrapping_add(1),
        flags: TCP_ACK,
        window: 0,
        mss: None,
        payload: &[],
    };
    engine.input_packet(&tcp_with(CLIENT, WEB, &ack));
    (io, iss)
}

#[test]
fn test_zero_window_is_probed_until_it_opens() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();
    let (io, iss) = connect_zero_window(&mut engine, &driver, &backend);

    assert_eq!(engine.write(io, b"data").unwrap(), 4);
    assert!(driver.take_written().is_empty());

    engine.process_timeouts(Instant::now() + Duration::from_secs(2));
    let probe = driver.take_segments().pop().unwrap();
    assert!(probe.has(TCP_ACK));
    assert!(probe.payload.is_empty());
    assert_eq!(probe.seq, iss);

    // Window opens in the answer to the probe
    engine.input_packet(&tcp(CLIENT, WEB, TCP_ACK, 1001, iss.wrapping_add(1), &[]));
    let data = driver.take_segments().pop().unwrap();
    assert_eq!(data.payload, b"data");
    assert_eq!(data.seq, iss.wrapping_add(1));
}

#[test]
fn test_zero_window_close_aborts_after_retries() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();
    let (io, _) = connect_zero_window(&mut engine, &driver, &backend);

    engine.write(io, b"data").unwrap();
    engine.close(io);
    assert_eq!(engine.ip_stats().connections[0].state, "FIN_WAIT_1");

    let start = Instant::now();
    for secs in 1..=600 {
        engine.process_timeouts(start + Duration::from_secs(secs));
    }

    let segments = driver.take_segments();
    let probes = segments.iter().filter(|s| !s.has(TCP_RST) && s.payload.is_empty()).count();
    assert_eq!(probes, 8);
    assert!(segments.last().unwrap().has(TCP_RST));

    let stats = engine.ip_stats();
    assert!(stats.connections.is_empty());
    assert_eq!(stats.pool("tcp_pcb").unwrap().used, 0);
}

#[test]
fn test_stats_json() {
    let driver = RecordingDriver::new();
    let backend = RecordingBackend::new();
    let mut engine = engine(&driver, &backend);
    engine.intercept(web_rule(1)).unwrap();
    connect(&mut engine, &driver, &backend, CLIENT, WEB);

    let stats = engine.ip_stats();
    assert_eq!(stats.intercepts, 1);
    assert_eq!(stats.pool("tcp_pcb").unwrap().used, 1);

    let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
    assert_eq!(json["connections"][0]["remote"], CLIENT);
    assert_eq!(json["connections"][0]["state"], "ESTABLISHED");
}

#[test]
fn test_version_accessors() {
    assert!(!tunnelgate::version().is_empty());
    assert!(!tunnelgate::build_date().is_empty());
    assert_eq!(tunnelgate::VERSION, env!("CARGO_PKG_VERSION"));
}
