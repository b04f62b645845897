use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use netlib::buffer::Buffer;
use netlib::replication::{NetworkHost, ReplicationManager};
use netlib::{Address, NetConfig, Server, ServerEvent};

const PLAYER_CLASS_ID: u32 = 1;

/// Minimal game-side entity table: a `DemoHost` only needs to know each
/// entity's position to answer replication callbacks, everything else
/// (rendering, gameplay) is out of scope for this demo.
struct DemoHost {
    positions: Vec<(f32, f32)>,
}

impl DemoHost {
    fn new() -> Self {
        DemoHost { positions: Vec::new() }
    }
}

impl NetworkHost for DemoHost {
    fn create_entity(
        &mut self,
        type_id: u32,
        network_entity_id: u32,
        controlled_by_peer_id: u32,
        pos_x: f32,
        pos_y: f32,
    ) -> u32 {
        info!(
            "creating entity {} (type {}, owner {}) at ({}, {})",
            network_entity_id, type_id, controlled_by_peer_id, pos_x, pos_y
        );
        self.positions.push((pos_x, pos_y));
        (self.positions.len() - 1) as u32
    }

    fn destroy_entity(&mut self, game_handle: u32) {
        info!("destroying entity handle {}", game_handle);
    }

    fn serialize_for_owner(&mut self, _network_entity_id: u32, _game_handle: u32, _buffer: &mut Buffer) {}
    fn serialize_for_non_owner(&mut self, _network_entity_id: u32, _game_handle: u32, _buffer: &mut Buffer) {}

    fn deserialize_for_owner(&mut self, network_entity_id: u32, _game_handle: u32, _buffer: &mut Buffer) {
        info!("server received an owner update for entity {} (unexpected, ignoring)", network_entity_id);
    }
}

fn main() -> netlib::Result<()> {
    env_logger::init();

    let config = NetConfig::default();
    let mut server = Server::bind(Address::new(Ipv4Addr::UNSPECIFIED, 9000), config)?;
    let mut replication: ReplicationManager<DemoHost> = ReplicationManager::new(DemoHost::new());

    // One network variable drives every avatar's x position, nudged each
    // tick; the coalescing handler collapses repeated sets into one delta
    // per entity before `server_replicate_world_state` drains it.
    let pos_x_var = replication.register_variable();
    let mut entity_of_peer: HashMap<u32, u32> = HashMap::new();

    server.on_connected(|(peer_id, address)| {
        info!("peer {} connected from {}", peer_id, address);
    });
    server.on_disconnected(|(peer_id, reason)| {
        info!("peer {} disconnected: {:?}", peer_id, reason);
    });

    info!("listening on {}", server.local_addr()?);

    let tick_interval = Duration::from_millis(33);
    let mut last = Instant::now();
    let mut elapsed = 0.0f32;
    loop {
        let now = Instant::now();
        let dt = (now - last).as_secs_f32();
        last = now;
        elapsed += dt;

        for event in server.tick(dt) {
            match event {
                ServerEvent::InGame { peer_id, bytes } => {
                    info!("in-game message from {}: {} bytes", peer_id, bytes.len());
                }
                ServerEvent::Replication { peer_id, message } => {
                    info!("unexpected replication message from peer {}: {:?}", peer_id, message);
                }
                ServerEvent::TimeRequest { peer_id, client_time } => {
                    info!("time request from {} at client time {}", peer_id, client_time);
                }
            }
        }

        let connected: Vec<u32> = server.connected_peer_ids();
        for &peer_id in &connected {
            if !entity_of_peer.contains_key(&peer_id) {
                let spawn_x = entity_of_peer.len() as f32 * 10.0;
                let entity_id = replication.create_entity(PLAYER_CLASS_ID, peer_id, spawn_x, 0.0);
                entity_of_peer.insert(peer_id, entity_id);
            }
        }
        entity_of_peer.retain(|peer_id, &mut entity_id| {
            let still_connected = connected.contains(peer_id);
            if !still_connected {
                replication.remove_entity(entity_id);
            }
            still_connected
        });

        for (&peer_id, &entity_id) in entity_of_peer.iter() {
            let x = peer_id as f32 * 10.0 + elapsed.sin() * 5.0;
            replication.set_variable(pos_x_var, entity_id, x);
        }
        replication.server_replicate_world_state();

        while let Some(message) = replication.next_pending() {
            server.broadcast_replication(message);
        }

        thread::sleep(tick_interval);
    }
}
