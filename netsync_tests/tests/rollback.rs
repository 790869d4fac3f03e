//! Client-side prediction with rollback, end to end.

use netsync_shared::config::SyncConfig;
use netsync_shared::frame::FrameIndex;
use netsync_tests::harness::Sim;
use std::cell::RefCell;
use std::rc::Rc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A late server snapshot disagrees with the predicted
/// state; the client applies it, rewinds, and re-simulates through its
/// retained inputs until the divergence is gone.
#[test]
fn divergence_is_detected_and_rolled_back() {
    init_tracing();
    let mut sim = Sim::new(SyncConfig::default(), &[2], 11);
    let object = sim.spawn_object("player", 2, 0);
    // Snapshots and inputs travel for 3 ticks, so every confirmation opens
    // a real rewind window.
    sim.network.set_delay_ticks(3);

    let desync_frames: Rc<RefCell<Vec<FrameIndex>>> = Rc::new(RefCell::new(Vec::new()));
    let seen = desync_frames.clone();
    sim.client_mut(2)
        .sync
        .event_state_validated
        .bind(move |(frame, desync)| {
            if *desync {
                seen.borrow_mut().push(*frame);
            }
        });

    for _ in 0..10 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }

    // Corrupt the predicted state by two units, as if the client had
    // mispredicted.
    sim.client_mut(2)
        .scene
        .poke_position(object.on_client(2), 2);

    for _ in 0..20 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }

    assert!(
        !desync_frames.borrow().is_empty(),
        "the corruption must surface as a desync"
    );

    // After the rewind the client state equals a server that simulated the
    // same inputs: 30 inputs of +1 and no trace of the poke.
    assert_eq!(sim.client(2).scene.position_of(object.on_client(2)), 30);

    // The server, three ticks behind on the last inputs, agrees on every
    // confirmed frame.
    let server_pos = sim.server.scene.position_of(object.on_server);
    assert!(
        (27..=30).contains(&server_pos),
        "server at {server_pos}, expected within the in-flight window"
    );
}

/// Soft variables are overwritten in place, with no rewind.
#[test]
fn soft_divergence_recovers_without_rewind() {
    init_tracing();
    use netsync_shared::object::{SceneHost, VarData, VarFlags};

    let mut sim = Sim::new(SyncConfig::default(), &[2], 11);

    // `position` is hard and input-driven; `glow` is cosmetic and soft.
    let vars = || {
        vec![
            ("position".to_string(), VarData::Int(0), VarFlags::empty()),
            ("glow".to_string(), VarData::Int(0), VarFlags::SKIP_REWINDING),
        ]
    };
    let (server_id, net_id) = sim.server.sync.register_object("lamp", 2, vars());
    sim.server.scene.add_object(server_id, 2, 0);
    sim.server
        .scene
        .set_var(server_id, "glow", &VarData::Int(0));

    let client_id = sim
        .client_mut(2)
        .sync
        .register_object("lamp", 2, vars(), net_id);
    sim.client_mut(2).scene.add_object(client_id, 2, 0);
    sim.client_mut(2)
        .scene
        .set_var(client_id, "glow", &VarData::Int(0));

    let desyncs: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let seen = desyncs.clone();
    sim.client_mut(2)
        .sync
        .event_state_validated
        .bind(move |(_, desync)| {
            if *desync {
                *seen.borrow_mut() += 1;
            }
        });

    for _ in 0..5 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }
    // Corrupt only the soft variable on the client.
    sim.client_mut(2)
        .scene
        .set_var(client_id, "glow", &VarData::Int(2));
    for _ in 0..10 {
        sim.client_mut(2).scene.set_wish(2, 1);
        sim.tick();
    }

    // The divergence was healed in place without ever flagging a desync.
    assert_eq!(*desyncs.borrow(), 0);
    assert_eq!(
        sim.client(2).scene.get_var(client_id, "glow"),
        Some(VarData::Int(0))
    );
    assert_eq!(sim.client(2).scene.position_of(client_id), 15);
}
