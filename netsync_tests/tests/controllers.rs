//! Player → server input flow, end to end over the in-memory transport.

use netsync_shared::config::SyncConfig;
use netsync_shared::frame::FrameIndex;
use netsync_shared::net::SERVER_PEER;
use netsync_tests::harness::Sim;
use netsync_tests::LossMode;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Lossless link: the server consumes inputs 0..9 in
/// order without a single ghost frame.
#[test]
fn player_to_server_no_loss() {
    init_tracing();
    let mut sim = Sim::new(SyncConfig::default(), &[2], 7);
    let object = sim.spawn_object("player", 2, 0);

    for _ in 0..10 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }

    let controller = sim.server.sync.controller(2).unwrap();
    assert_eq!(controller.current_frame_index(), FrameIndex(9));
    assert_eq!(
        controller.server_controller().unwrap().remote.ghost_input_count,
        0
    );

    // Every input was applied exactly once on both sides.
    assert_eq!(sim.server.scene.position_of(object.on_server), 10);
    assert_eq!(
        sim.client(2).scene.position_of(object.on_client(2)),
        10
    );
    // And the client validated its prediction against the server.
    assert!(sim.client(2).sync.last_checked_frame() >= FrameIndex(8));
}

/// Every other input datagram toward the server is dropped;
/// with 3 redundant inputs per packet the server still observes every id.
#[test]
fn player_to_server_survives_50pct_loss() {
    init_tracing();
    let mut config = SyncConfig::default();
    config.max_redundant_inputs = 3;
    let mut sim = Sim::new(config, &[2], 7);
    sim.spawn_object("player", 2, 0);
    sim.network
        .set_loss_toward(SERVER_PEER, LossMode::EveryNth(2));

    for _ in 0..12 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }
    assert!(sim.network.dropped_unreliable() > 0, "the link actually lost packets");

    let controller = sim.server.sync.controller(2).unwrap();
    let server = controller.server_controller().unwrap();
    // The server caught up through the redundancy: it sits one frame behind
    // at most and is not ghosting.
    assert!(controller.current_frame_index() >= FrameIndex(10));
    assert_eq!(server.remote.ghost_input_count, 0);

    // Reconciliation kept working through the loss.
    assert!(sim.client(2).sync.last_checked_frame() >= FrameIndex(8));
}

/// Once the collected input is empty and the server has
/// confirmed it, no datagrams leave the client until a real input appears.
#[test]
fn stream_pause_stops_datagrams() {
    init_tracing();
    let mut sim = Sim::new(SyncConfig::default(), &[2], 7);
    let object = sim.spawn_object("player", 2, 0);

    for _ in 0..5 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }
    // Go idle and let the server confirm the empty input.
    sim.client_mut(2).scene.set_wish(2, 0);
    sim.run(8);

    let player = sim
        .client(2)
        .sync
        .player_controller()
        .player_controller()
        .unwrap();
    assert!(player.is_streaming_paused(), "stream should be paused");

    let sent_before = sim.network.delivered_toward(SERVER_PEER);
    sim.run(5);
    assert_eq!(
        sim.network.delivered_toward(SERVER_PEER),
        sent_before,
        "no datagrams while paused"
    );

    // A real input resumes the stream immediately.
    sim.client_mut(2).scene.set_wish(2, 3);
    sim.tick();
    assert!(sim.network.delivered_toward(SERVER_PEER) > sent_before);
    let player = sim
        .client(2)
        .sync
        .player_controller()
        .player_controller()
        .unwrap();
    assert!(!player.is_streaming_paused());

    // The resumed input reaches the authoritative state too.
    sim.client_mut(2).scene.set_wish(2, 0);
    sim.run(4);
    assert_eq!(sim.server.scene.position_of(object.on_server), 8);
}
