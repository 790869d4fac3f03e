//! Sync-group membership driven through the server synchronizer.

use netsync_shared::config::SyncConfig;
use netsync_shared::net::SyncGroupId;
use netsync_tests::harness::Sim;

/// Peer 42 owns a simulated object in the global group; removing the
/// object drops 42 from the simulating peers and tears down every
/// listener's simulating relation.
#[test]
fn removing_owned_object_clears_simulating_peer() {
    let mut sim = Sim::new(SyncConfig::default(), &[2, 42], 3);
    let object = sim.spawn_object("avatar", 42, 0);

    let group = sim.server.sync.sync_group(SyncGroupId::GLOBAL).unwrap();
    assert!(group.simulating_peers().contains(&42));
    assert!(group.networked_peers().contains(&42));
    // Listener 2 was wired into 42's controller when the object joined.
    assert!(sim
        .server
        .sync
        .controller(42)
        .unwrap()
        .server_is_peer_simulating_this_controller(2));

    sim.server
        .sync
        .sync_group_remove_object(SyncGroupId::GLOBAL, object.on_server);

    let group = sim.server.sync.sync_group(SyncGroupId::GLOBAL).unwrap();
    assert!(!group.simulating_peers().contains(&42));
    assert!(!group.networked_peers().contains(&42));
    assert!(!sim
        .server
        .sync
        .controller(42)
        .unwrap()
        .server_is_peer_simulating_this_controller(2));
}

/// Moving a peer between groups re-subscribes it and rewires the
/// simulating relations.
#[test]
fn moving_a_peer_between_groups_rewires_listeners() {
    let mut sim = Sim::new(SyncConfig::default(), &[2, 42], 3);
    let object = sim.spawn_object("avatar", 42, 0);

    let arena = sim.server.sync.create_sync_group();
    sim.server.sync.sync_group_move_peer_to(arena, 2);

    // Gone from the global group's audience...
    let global = sim.server.sync.sync_group(SyncGroupId::GLOBAL).unwrap();
    assert!(!global.listening_peers().contains(&2));
    assert!(sim.server.sync.sync_group(arena).unwrap().listening_peers().contains(&2));
    // ...so 42's controller no longer echoes inputs to it.
    assert!(!sim
        .server
        .sync
        .controller(42)
        .unwrap()
        .server_is_peer_simulating_this_controller(2));

    // Bringing the object into the new group rewires the relation.
    sim.server
        .sync
        .sync_group_add_object(arena, object.on_server, true);
    assert!(sim
        .server
        .sync
        .controller(42)
        .unwrap()
        .server_is_peer_simulating_this_controller(2));
}
