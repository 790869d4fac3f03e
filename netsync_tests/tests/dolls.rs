//! Doll replay: a second client follows a remote authority through the
//! server's input echo and per-doll snapshots.

use netsync_shared::config::SyncConfig;
use netsync_shared::frame::FrameIndex;
use netsync_tests::harness::Sim;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

#[test]
fn doll_replays_the_remote_authority() {
    init_tracing();
    let mut sim = Sim::new(SyncConfig::default(), &[2, 3], 5);
    let ball = sim.spawn_object("ball", 2, 0);

    // Client 3 owns nothing; it watches peer 2 through a doll.
    assert!(sim
        .client(3)
        .sync
        .controller(2)
        .map(|c| c.is_doll_controller())
        .unwrap_or(false));

    for _ in 0..30 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }

    // The server echoed 2's packets to 3, and the doll consumed them on its
    // own timeline.
    let doll = sim.client(3).sync.controller(2).unwrap();
    let doll_frame = doll.current_frame_index();
    assert!(
        doll_frame >= FrameIndex(20),
        "doll should have replayed most of the stream, at {doll_frame}"
    );

    // The doll's world tracks the authority's movement.
    let doll_position = sim.client(3).scene.position_of(ball.on_client(3));
    assert!(
        (20..=31).contains(&doll_position),
        "doll position {doll_position} should track the authority"
    );

    // The authority's own client stays the most up to date.
    assert_eq!(sim.client(2).scene.position_of(ball.on_client(2)), 30);
}

#[test]
fn doll_stalls_without_inputs_when_guessing_is_disabled() {
    init_tracing();
    let mut config = SyncConfig::default();
    config.lag_compensation.doll_allow_guess_input_when_missing = false;
    let mut sim = Sim::new(config, &[2, 3], 5);
    let ball = sim.spawn_object("ball", 2, 0);

    for _ in 0..10 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }
    let frame_when_fed = sim.client(3).sync.controller(2).unwrap().current_frame_index();

    // The authority goes quiet: its stream pauses, so no new inputs reach
    // the doll, and the doll must not advance past its deque.
    sim.client_mut(2).scene.set_wish(2, 0);
    sim.run(10);

    let doll = sim.client(3).sync.controller(2).unwrap();
    let advanced_by = doll.current_frame_index().0 - frame_when_fed.0;
    // At most the couple of empty inputs sent before the pause engaged.
    assert!(
        advanced_by <= 4,
        "doll advanced {advanced_by} frames with an empty stream"
    );
}
