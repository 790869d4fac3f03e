//! In-memory test harness: a lossy, delayable transport plus a reference
//! scene host, so the end-to-end scenarios run without sockets.

use bytes::Bytes;
use netsync_shared::data_buffer::{DataBuffer, Level2};
use netsync_shared::net::{NetworkInterface, PeerData, PeerId};
use netsync_shared::object::{ObjectLocalId, SceneHost, VarData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// How the hub treats unreliable datagrams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossMode {
    None,
    /// Drop with this probability, seeded and reproducible.
    Random(f32),
    /// Deterministically drop every n-th unreliable datagram.
    EveryNth(u32),
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub sender: PeerId,
    pub reliable: bool,
    pub data: Bytes,
}

struct PendingDatagram {
    ready_at_tick: u64,
    datagram: Datagram,
}

struct HubState {
    inboxes: HashMap<PeerId, VecDeque<PendingDatagram>>,
    peers: Vec<PeerId>,
    /// Loss policy per recipient; absent means lossless.
    loss: HashMap<PeerId, LossMode>,
    unreliable_counters: HashMap<PeerId, u32>,
    sent_counters: HashMap<PeerId, u32>,
    dropped_unreliable: u32,
    rng: StdRng,
    tick: u64,
    delay_ticks: u64,
    simulated_latency_ms: f32,
}

/// The in-memory network all endpoints share. Single-threaded by design:
/// the test loop owns both sides and pumps datagrams explicitly.
#[derive(Clone)]
pub struct LocalNetwork {
    state: Rc<RefCell<HubState>>,
}

impl LocalNetwork {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(HubState {
                inboxes: HashMap::new(),
                peers: Vec::new(),
                loss: HashMap::new(),
                unreliable_counters: HashMap::new(),
                sent_counters: HashMap::new(),
                dropped_unreliable: 0,
                rng: StdRng::seed_from_u64(seed),
                tick: 0,
                delay_ticks: 0,
                simulated_latency_ms: 40.0,
            })),
        }
    }

    /// Creates the transport endpoint for a peer and opens its inbox.
    pub fn endpoint(&self, peer_id: PeerId) -> LocalEndpoint {
        let mut state = self.state.borrow_mut();
        state.inboxes.entry(peer_id).or_default();
        if !state.peers.contains(&peer_id) {
            state.peers.push(peer_id);
        }
        LocalEndpoint {
            peer_id,
            state: self.state.clone(),
        }
    }

    /// Applies a loss policy to the datagrams addressed to `recipient`.
    pub fn set_loss_toward(&self, recipient: PeerId, loss: LossMode) {
        self.state.borrow_mut().loss.insert(recipient, loss);
    }

    /// Extra whole ticks every datagram sits in flight.
    pub fn set_delay_ticks(&self, delay: u64) {
        self.state.borrow_mut().delay_ticks = delay;
    }

    /// Advances the in-flight clock; call once per simulated tick.
    pub fn advance_tick(&self) {
        self.state.borrow_mut().tick += 1;
    }

    pub fn dropped_unreliable(&self) -> u32 {
        self.state.borrow().dropped_unreliable
    }

    /// Datagrams that survived loss on their way to `peer`.
    pub fn delivered_toward(&self, peer: PeerId) -> u32 {
        self.state
            .borrow()
            .sent_counters
            .get(&peer)
            .copied()
            .unwrap_or(0)
    }

    /// Removes and returns the matured datagrams addressed to `peer`.
    pub fn drain(&self, peer: PeerId) -> Vec<Datagram> {
        let mut state = self.state.borrow_mut();
        let tick = state.tick;
        let Some(inbox) = state.inboxes.get_mut(&peer) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(pending) = inbox.front() {
            if pending.ready_at_tick > tick {
                break;
            }
            out.push(inbox.pop_front().unwrap().datagram);
        }
        out
    }
}

/// One peer's view of the [`LocalNetwork`].
pub struct LocalEndpoint {
    peer_id: PeerId,
    state: Rc<RefCell<HubState>>,
}

impl NetworkInterface for LocalEndpoint {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn fetch_connected_peers(&self) -> Vec<PeerId> {
        self.state
            .borrow()
            .peers
            .iter()
            .copied()
            .filter(|p| *p != self.peer_id)
            .collect()
    }

    fn send(&mut self, peer: PeerId, reliable: bool, data: Bytes) {
        let mut state = self.state.borrow_mut();

        if !reliable {
            let counter = state.unreliable_counters.entry(peer).or_insert(0);
            *counter += 1;
            let counter = *counter;
            let drop = match state.loss.get(&peer).copied().unwrap_or(LossMode::None) {
                LossMode::None => false,
                LossMode::Random(fraction) => state.rng.gen::<f32>() < fraction,
                LossMode::EveryNth(n) => counter % n == 0,
            };
            if drop {
                state.dropped_unreliable += 1;
                return;
            }
        }

        let ready_at_tick = state.tick + state.delay_ticks;
        let sender = self.peer_id;
        *state.sent_counters.entry(peer).or_insert(0) += 1;
        if let Some(inbox) = state.inboxes.get_mut(&peer) {
            inbox.push_back(PendingDatagram {
                ready_at_tick,
                datagram: Datagram {
                    sender,
                    reliable,
                    data,
                },
            });
        }
    }

    fn server_update_net_stats(&self, _peer: PeerId, peer_data: &mut PeerData) {
        let latency = self.state.borrow().simulated_latency_ms;
        peer_data.set_latency_ms(latency);
    }
}

/// Reference scene host: each peer controls one object whose `position`
/// (an integer) moves by the per-frame wish value. Deterministic on both
/// sides by construction.
#[derive(Default)]
pub struct TestScene {
    vars: HashMap<(ObjectLocalId, String), VarData>,
    controlled: HashMap<PeerId, ObjectLocalId>,
    wishes: HashMap<PeerId, i64>,
}

impl TestScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks an object with a starting `position`, controlled by `peer`.
    pub fn add_object(&mut self, local_id: ObjectLocalId, peer: PeerId, position: i64) {
        self.vars
            .insert((local_id, "position".into()), VarData::Int(position));
        if peer != 0 {
            self.controlled.insert(peer, local_id);
        }
    }

    /// Sets what `peer` wants to do next frame; 0 produces an empty input.
    pub fn set_wish(&mut self, peer: PeerId, wish: i64) {
        self.wishes.insert(peer, wish);
    }

    pub fn position_of(&self, local_id: ObjectLocalId) -> i64 {
        match self.vars.get(&(local_id, "position".into())) {
            Some(VarData::Int(v)) => *v,
            _ => panic!("object {local_id:?} has no position"),
        }
    }

    /// Test-only divergence injector.
    pub fn poke_position(&mut self, local_id: ObjectLocalId, offset: i64) {
        let position = self.position_of(local_id);
        self.vars
            .insert((local_id, "position".into()), VarData::Int(position + offset));
    }

    pub fn var_descriptor() -> Vec<(String, VarData, netsync_shared::object::VarFlags)> {
        vec![(
            "position".into(),
            VarData::Int(0),
            netsync_shared::object::VarFlags::empty(),
        )]
    }
}

impl SceneHost for TestScene {
    fn get_var(&self, object: ObjectLocalId, var: &str) -> Option<VarData> {
        self.vars.get(&(object, var.to_string())).cloned()
    }

    fn set_var(&mut self, object: ObjectLocalId, var: &str, value: &VarData) {
        self.vars.insert((object, var.to_string()), value.clone());
    }

    fn collect_input(&mut self, peer: PeerId, _delta: f32, buf: &mut DataBuffer) {
        let wish = self.wishes.get(&peer).copied().unwrap_or(0);
        // A zero wish writes nothing: that is what pauses the stream.
        if wish != 0 {
            buf.add_int(wish, Level2);
        }
    }

    fn count_input_size(&self, _peer: PeerId, buf: &mut DataBuffer) -> u16 {
        buf.skip_int(Level2);
        DataBuffer::int_size(Level2) as u16
    }

    fn are_inputs_different(&self, _peer: PeerId, a: &mut DataBuffer, b: &mut DataBuffer) -> bool {
        let av = if a.size() > 0 { a.read_int(Level2) } else { 0 };
        let bv = if b.size() > 0 { b.read_int(Level2) } else { 0 };
        av != bv
    }

    fn process(&mut self, peer: PeerId, _delta: f32, input: &mut DataBuffer) {
        let wish = if input.size() > 0 {
            input.read_int(Level2)
        } else {
            0
        };
        if let Some(local_id) = self.controlled.get(&peer).copied() {
            let position = self.position_of(local_id);
            self.vars
                .insert((local_id, "position".into()), VarData::Int(position + wish));
        }
    }
}

pub mod harness {
    //! One server plus N clients wired through a [`LocalNetwork`],
    //! advanced in lockstep one fixed tick at a time.

    use super::{LocalEndpoint, LocalNetwork, TestScene};
    use netsync_client::ClientSynchronizer;
    use netsync_server::ServerSynchronizer;
    use netsync_shared::config::SyncConfig;
    use netsync_shared::net::{PeerId, SERVER_PEER};
    use netsync_shared::object::{ObjectLocalId, ObjectNetId};

    pub struct ServerSim {
        pub sync: ServerSynchronizer,
        pub scene: TestScene,
        pub endpoint: LocalEndpoint,
    }

    pub struct ClientSim {
        pub peer: PeerId,
        pub sync: ClientSynchronizer,
        pub scene: TestScene,
        pub endpoint: LocalEndpoint,
    }

    /// Handles of one object spawned on every participant.
    pub struct SpawnedObject {
        pub net_id: ObjectNetId,
        pub on_server: ObjectLocalId,
        pub on_clients: Vec<(PeerId, ObjectLocalId)>,
    }

    impl SpawnedObject {
        pub fn on_client(&self, peer: PeerId) -> ObjectLocalId {
            self.on_clients
                .iter()
                .find(|(p, _)| *p == peer)
                .map(|(_, id)| *id)
                .expect("object spawned on that client")
        }
    }

    pub struct Sim {
        pub network: LocalNetwork,
        pub server: ServerSim,
        pub clients: Vec<ClientSim>,
        pub now_ms: u32,
        delta: f32,
    }

    impl Sim {
        pub fn new(config: SyncConfig, client_peers: &[PeerId], seed: u64) -> Self {
            let network = LocalNetwork::new(seed);
            let delta = config.fixed_frame_delta;

            let mut server_sync = ServerSynchronizer::new(config.clone());
            let server_endpoint = network.endpoint(SERVER_PEER);
            for peer in client_peers {
                server_sync.on_peer_connected(*peer);
            }

            let clients = client_peers
                .iter()
                .map(|peer| ClientSim {
                    peer: *peer,
                    sync: ClientSynchronizer::new(config.clone(), *peer),
                    scene: TestScene::new(),
                    endpoint: network.endpoint(*peer),
                })
                .collect();

            Self {
                network,
                server: ServerSim {
                    sync: server_sync,
                    scene: TestScene::new(),
                    endpoint: server_endpoint,
                },
                clients,
                now_ms: 0,
                delta,
            }
        }

        pub fn client_mut(&mut self, peer: PeerId) -> &mut ClientSim {
            self.clients
                .iter_mut()
                .find(|c| c.peer == peer)
                .expect("known client")
        }

        pub fn client(&self, peer: PeerId) -> &ClientSim {
            self.clients
                .iter()
                .find(|c| c.peer == peer)
                .expect("known client")
        }

        /// Registers one object everywhere, controlled by `owner`.
        pub fn spawn_object(&mut self, name: &str, owner: PeerId, position: i64) -> SpawnedObject {
            let (server_id, net_id) =
                self.server
                    .sync
                    .register_object(name, owner, TestScene::var_descriptor());
            self.server.scene.add_object(server_id, owner, position);

            let mut on_clients = Vec::new();
            for client in &mut self.clients {
                let local_id = client.sync.register_object(
                    name,
                    owner,
                    TestScene::var_descriptor(),
                    net_id,
                );
                client.scene.add_object(local_id, owner, position);
                on_clients.push((client.peer, local_id));
            }

            SpawnedObject {
                net_id,
                on_server: server_id,
                on_clients,
            }
        }

        /// One lockstep tick: clients simulate and send, the server consumes
        /// and broadcasts, then everything in flight is delivered.
        pub fn tick(&mut self) {
            for client in &mut self.clients {
                client.sync.process_tick(&mut client.scene, &mut client.endpoint);
            }

            for datagram in self.network.drain(SERVER_PEER) {
                let _ = self.server.sync.rpc_receive(
                    datagram.sender,
                    datagram.data,
                    self.now_ms,
                    &mut self.server.scene,
                    &mut self.server.endpoint,
                );
            }

            self.server
                .sync
                .process(self.delta, &mut self.server.scene, &mut self.server.endpoint);

            for client in &mut self.clients {
                for datagram in self.network.drain(client.peer) {
                    let _ = client.sync.rpc_receive(
                        datagram.sender,
                        datagram.data,
                        self.now_ms,
                        &mut client.scene,
                    );
                }
            }

            self.network.advance_tick();
            self.now_ms += (self.delta * 1000.0) as u32;
        }

        pub fn run(&mut self, ticks: usize) {
            for _ in 0..ticks {
                self.tick();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_mature_after_the_delay() {
        let network = LocalNetwork::new(1);
        let mut a = network.endpoint(1);
        let _b = network.endpoint(2);
        network.set_delay_ticks(2);

        a.send(2, true, Bytes::from_static(b"hi"));
        assert!(network.drain(2).is_empty());
        network.advance_tick();
        assert!(network.drain(2).is_empty());
        network.advance_tick();
        let arrived = network.drain(2);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].sender, 1);
    }

    #[test]
    fn every_nth_loss_only_touches_unreliable() {
        let network = LocalNetwork::new(1);
        let mut a = network.endpoint(1);
        let _b = network.endpoint(2);
        network.set_loss_toward(2, LossMode::EveryNth(2));

        for _ in 0..4 {
            a.send(2, false, Bytes::from_static(b"u"));
            a.send(2, true, Bytes::from_static(b"r"));
        }
        let arrived = network.drain(2);
        // Half the unreliable ones dropped, all the reliable ones arrived.
        assert_eq!(arrived.iter().filter(|d| !d.reliable).count(), 2);
        assert_eq!(arrived.iter().filter(|d| d.reliable).count(), 4);
        assert_eq!(network.dropped_unreliable(), 2);
    }

    #[test]
    fn scene_applies_wishes_per_peer() {
        let mut scene = TestScene::new();
        scene.add_object(ObjectLocalId(0), 2, 10);
        scene.set_wish(2, 5);

        let mut input = DataBuffer::new();
        input.begin_write(0);
        scene.collect_input(2, 0.016, &mut input);
        input.dry();
        input.begin_read();
        scene.process(2, 0.016, &mut input);
        assert_eq!(scene.position_of(ObjectLocalId(0)), 15);
    }
}
