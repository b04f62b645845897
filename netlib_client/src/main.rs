use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use netlib::buffer::Buffer;
use netlib::replication::{NetworkHost, ReplicationManager};
use netlib::variable::NetworkVariableChangesHandler;
use netlib::{Address, Client, ClientEvent, NetConfig};

/// Mirrors the server's `DemoHost`: tracks a position per network entity and
/// applies incoming `RAT_UPDATE` deltas to it.
struct DemoHost {
    positions: HashMap<u32, (f32, f32)>,
}

impl DemoHost {
    fn new() -> Self {
        DemoHost {
            positions: HashMap::new(),
        }
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
            "spawning entity {} (type {}, owner {}) at ({}, {})",
            network_entity_id, type_id, controlled_by_peer_id, pos_x, pos_y
        );
        self.positions.insert(network_entity_id, (pos_x, pos_y));
        network_entity_id
    }

    fn destroy_entity(&mut self, game_handle: u32) {
        info!("despawning entity {}", game_handle);
        self.positions.remove(&game_handle);
    }

    fn serialize_for_owner(&mut self, _network_entity_id: u32, _game_handle: u32, _buffer: &mut Buffer) {}
    fn serialize_for_non_owner(&mut self, _network_entity_id: u32, _game_handle: u32, _buffer: &mut Buffer) {}

    fn deserialize_for_owner(&mut self, network_entity_id: u32, game_handle: u32, buffer: &mut Buffer) {
        let entry = self.positions.entry(game_handle).or_insert((0.0, 0.0));
        let _ = NetworkVariableChangesHandler::apply(buffer, |_entity_id, variable_id, value| {
            // A lone demo variable tracks x; any other id is logged and skipped.
            if variable_id == 0 {
                entry.0 = value;
            } else {
                info!("entity {} ignoring unknown variable {}", network_entity_id, variable_id);
            }
        });
    }
}

fn main() -> netlib::Result<()> {
    env_logger::init();

    let config = NetConfig::default();
    let mut client = Client::bind(Address::new(Ipv4Addr::UNSPECIFIED, 0), config)?;
    let mut replication: ReplicationManager<DemoHost> = ReplicationManager::new(DemoHost::new());

    client.on_connected(|peer_id| {
        info!("connected, assigned peer id {}", peer_id);
    });
    client.on_disconnected(|reason| {
        info!("disconnected: {:?}", reason);
    });

    client.connect(Address::new(Ipv4Addr::new(127, 0, 0, 1), 9000))?;

    let tick_interval = Duration::from_millis(33);
    let mut last = Instant::now();
    let mut elapsed_connected = 0.0f32;
    loop {
        let now = Instant::now();
        let dt = (now - last).as_secs_f32();
        last = now;

        for event in client.tick(dt) {
            match event {
                ClientEvent::InGame { bytes } => info!("in-game message: {} bytes", bytes.len()),
                ClientEvent::Replication { sequence, message } => replication.client_process(&message, sequence),
                ClientEvent::TimeResponse { client_time, server_time } => {
                    info!("time response: client={} server={}", client_time, server_time)
                }
            }
        }

        if client.is_connected() {
            elapsed_connected += dt;
            client.send_time_request(elapsed_connected)?;
        }

        thread::sleep(tick_interval);
    }
}
