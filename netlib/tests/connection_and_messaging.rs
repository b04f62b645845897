use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use netlib::buffer::Buffer;
use netlib::replication::{NetworkHost, ReplicationManager, ReplicationMessage};
use netlib::{Address, Client, ClientEvent, NetConfig, Server, ServerEvent};

fn local(port: u16) -> Address {
    Address::new(Ipv4Addr::new(127, 0, 0, 1), port)
}

fn pump(server: &mut Server, client: &mut Client, ticks: u32) -> (Vec<ServerEvent>, Vec<ClientEvent>) {
    let mut server_events = Vec::new();
    let mut client_events = Vec::new();
    for _ in 0..ticks {
        server_events.extend(server.tick(0.02));
        client_events.extend(client.tick(0.02));
        thread::sleep(Duration::from_millis(5));
    }
    (server_events, client_events)
}

#[test]
fn client_connects_and_server_fires_connected_callback() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();

    let connected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let connected_clone = connected.clone();
    server.on_connected(move |(peer_id, _)| connected_clone.lock().unwrap().push(*peer_id));

    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();

    pump(&mut server, &mut client, 20);

    assert!(client.is_connected());
    assert_eq!(connected.lock().unwrap().len(), 1);
}

#[test]
fn in_game_message_round_trips_both_directions() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();
    pump(&mut server, &mut client, 20);
    assert!(client.is_connected());

    client.send_in_game(vec![1, 2, 3], true, true).unwrap();
    let (server_events, _) = pump(&mut server, &mut client, 10);

    let received = server_events.iter().find_map(|e| match e {
        ServerEvent::InGame { bytes, .. } => Some(bytes.clone()),
        _ => None,
    });
    assert_eq!(received, Some(vec![1, 2, 3]));

    let peer_id = server.connected_peer_ids()[0];
    server.send_in_game(peer_id, vec![9, 9], false, false).unwrap();
    let (_, client_events) = pump(&mut server, &mut client, 10);
    let received_back = client_events.iter().find_map(|e| match e {
        ClientEvent::InGame { bytes } => Some(bytes.clone()),
        _ => None,
    });
    assert_eq!(received_back, Some(vec![9, 9]));
}

#[test]
fn time_request_gets_a_time_response() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();
    pump(&mut server, &mut client, 20);
    assert!(client.is_connected());

    client.send_time_request(1.5).unwrap();
    let (_, client_events) = pump(&mut server, &mut client, 10);

    let response = client_events.iter().find_map(|e| match e {
        ClientEvent::TimeResponse { client_time, server_time } => Some((*client_time, *server_time)),
        _ => None,
    });
    assert!(matches!(response, Some((client_time, server_time)) if client_time == 1.5 && server_time > 0.0));
}

#[test]
fn server_denies_connection_once_at_capacity() {
    let mut config = NetConfig::default();
    config.max_connections = 1;
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut first = Client::bind(local(0), config).unwrap();
    first.connect(server_addr).unwrap();
    let mut second = Client::bind(local(0), config).unwrap();
    second.connect(server_addr).unwrap();

    for _ in 0..20 {
        server.tick(0.02);
        first.tick(0.02);
        second.tick(0.02);
        thread::sleep(Duration::from_millis(5));
    }

    assert!(first.is_connected() ^ second.is_connected());
}

#[test]
fn client_stop_notifies_server_and_fires_local_disconnect_once() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();
    pump(&mut server, &mut client, 20);
    assert!(client.is_connected());

    let local_disconnects = std::sync::Arc::new(std::sync::Mutex::new(0));
    let counted = local_disconnects.clone();
    client.on_local_disconnect(move |_| *counted.lock().unwrap() += 1);

    client.stop(netlib::DisconnectReason::PeerShutDown).unwrap();
    assert!(!client.is_connected());
    assert_eq!(*local_disconnects.lock().unwrap(), 1);

    // A second stop() while already disconnected is a no-op: no double fire.
    client.stop(netlib::DisconnectReason::PeerShutDown).unwrap();
    assert_eq!(*local_disconnects.lock().unwrap(), 1);

    let (server_events, _) = pump(&mut server, &mut client, 10);
    let _ = server_events;
    assert!(server.connected_peer_ids().is_empty());
}

#[test]
fn server_stop_notifies_remotes_and_clears_the_peer_set() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();
    pump(&mut server, &mut client, 20);
    assert!(client.is_connected());

    let local_disconnects = std::sync::Arc::new(std::sync::Mutex::new(0));
    let counted = local_disconnects.clone();
    server.on_local_disconnect(move |_| *counted.lock().unwrap() += 1);

    server.stop(netlib::DisconnectReason::Unknown);
    assert!(server.connected_peer_ids().is_empty());
    assert_eq!(*local_disconnects.lock().unwrap(), 1);

    pump(&mut server, &mut client, 10);
    assert!(!client.is_connected());
}

#[test]
fn repeated_connection_request_before_acceptance_does_not_duplicate_the_peer() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();

    // Force a couple of retries before any reply lands, simulating a client
    // that resends its ConnectionRequest because the first challenge was lost.
    for _ in 0..3 {
        server.tick(0.02);
        client.tick(config.connect_retry_interval + 0.01);
        thread::sleep(Duration::from_millis(5));
    }
    pump(&mut server, &mut client, 20);

    assert!(client.is_connected());
    assert_eq!(server.connected_peer_ids().len(), 1);
}

struct EchoHost {
    positions: std::collections::HashMap<u32, f32>,
}

impl NetworkHost for EchoHost {
    fn create_entity(&mut self, _type_id: u32, network_entity_id: u32, _owner: u32, pos_x: f32, _pos_y: f32) -> u32 {
        self.positions.insert(network_entity_id, pos_x);
        network_entity_id
    }

    fn destroy_entity(&mut self, game_handle: u32) {
        self.positions.remove(&game_handle);
    }

    fn serialize_for_owner(&mut self, _id: u32, _handle: u32, _buffer: &mut Buffer) {}
    fn serialize_for_non_owner(&mut self, _id: u32, _handle: u32, _buffer: &mut Buffer) {}

    fn deserialize_for_owner(&mut self, _id: u32, game_handle: u32, buffer: &mut Buffer) {
        let slot = self.positions.entry(game_handle).or_insert(0.0);
        let _ = netlib::variable::NetworkVariableChangesHandler::apply(buffer, |_entity, _var, value| {
            *slot = value;
        });
    }
}

#[test]
fn entity_create_update_destroy_replicates_end_to_end() {
    let config = NetConfig::default();
    let mut server = Server::bind(local(0), config).unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Client::bind(local(0), config).unwrap();
    client.connect(server_addr).unwrap();
    pump(&mut server, &mut client, 20);
    assert!(client.is_connected());

    let mut replication: ReplicationManager<EchoHost> =
        ReplicationManager::new(EchoHost { positions: std::collections::HashMap::new() });
    let mut client_replication: ReplicationManager<EchoHost> =
        ReplicationManager::new(EchoHost { positions: std::collections::HashMap::new() });

    let entity_id = replication.create_entity(7, 0, 3.0, -1.0);
    let var = replication.register_variable();
    replication.set_variable(var, entity_id, 42.0);
    replication.server_replicate_world_state();
    while let Some(message) = replication.next_pending() {
        server.broadcast_replication(message);
    }

    let mut seen_update = false;
    for _ in 0..20 {
        server.tick(0.02);
        for event in client.tick(0.02) {
            if let ClientEvent::Replication { sequence, message } = event {
                if matches!(message, ReplicationMessage::Update { .. }) {
                    seen_update = true;
                }
                client_replication.client_process(&message, sequence);
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert!(seen_update);
    assert_eq!(client_replication.host_mut().positions.get(&entity_id), Some(&42.0));

    replication.remove_entity(entity_id);
    while let Some(message) = replication.next_pending() {
        server.broadcast_replication(message);
    }
    for _ in 0..20 {
        server.tick(0.02);
        for event in client.tick(0.02) {
            if let ClientEvent::Replication { sequence, message } = event {
                client_replication.client_process(&message, sequence);
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    assert!(!client_replication.host_mut().positions.contains_key(&entity_id));
}
