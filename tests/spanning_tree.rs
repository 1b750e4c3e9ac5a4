//! Linking, routing and netsplits across several in-process servers.

mod common;

use common::{Net, Recorder, START};
use treelinkd::sync::{LinkState, OperError};

/// Two servers complete the handshake and see each other as direct peers.
#[test]
fn two_servers_link_and_finish_bursting() {
    let mut net = Net::new(&["hub.test", "leaf.test"]);
    net.link("hub.test", "leaf.test");

    for (us, them) in [("hub.test", "leaf.test"), ("leaf.test", "hub.test")] {
        let tree = net.node(us);
        assert_eq!(tree.directory().len(), 2);
        let peer = tree.directory().find(them).expect("peer in directory");
        assert_eq!(tree.directory().route_of(peer), Some(peer));
        assert_eq!(tree.directory().get(peer).unwrap().hops, 1);

        let conn = tree
            .connections()
            .find(|c| c.node == Some(peer))
            .expect("connection for peer");
        assert_eq!(conn.state, LinkState::Connected);
        assert!(!conn.bursting, "{us} still thinks {them} is bursting");
    }

    let version = net.node("hub.test").remote_version("leaf.test").unwrap();
    assert!(version.starts_with("treelinkd-"));
}

/// Routes point at the direct peer on the path, and every server agrees on
/// hop counts relative to itself.
#[test]
fn chain_routes_through_direct_peers() {
    let mut net = Net::new(&["a.test", "b.test", "c.test", "d.test"]);
    net.link("a.test", "b.test");
    net.link("b.test", "c.test");
    net.link("c.test", "d.test");

    for name in ["a.test", "b.test", "c.test", "d.test"] {
        assert_eq!(net.servers_seen_by(name).len(), 4, "{name} misses a server");
    }

    let a = net.node("a.test");
    let b_id = a.directory().find("b.test");
    assert_eq!(a.route_for("d.test"), b_id);
    assert_eq!(a.route_for("c.test"), b_id);
    assert_eq!(a.directory().by_name("d.test").unwrap().hops, 3);

    let d = net.node("d.test");
    assert_eq!(d.route_for("a.test"), d.directory().find("c.test"));
    assert_eq!(d.directory().by_name("a.test").unwrap().hops, 3);
}

/// A server already in the tree cannot be linked a second time.
#[test]
fn second_path_to_a_known_server_is_refused() {
    let mut net = Net::new(&["hub.test", "b.test", "c.test"]);
    net.link("hub.test", "b.test");
    net.link("hub.test", "c.test");

    let err = net.node_mut("c.test").connect("b.test").unwrap_err();
    assert_eq!(err, OperError::AlreadyLinked("b.test".into()));
}

/// Users introduced on a leaf reach the far side of the hub, and the hub
/// never reflects a line back to the server it came from.
#[test]
fn introductions_are_not_reflected_to_the_sender() {
    let mut net = Net::new(&["hub.test", "left.test", "right.test"]);
    net.link("hub.test", "left.test");
    net.link("hub.test", "right.test");
    net.clear_wire();

    net.add_user("left.test", "alice", START);
    net.pump();

    let right = net.node("right.test");
    let alice = right.state().user_by_nick("alice").expect("alice reached right");
    assert_eq!(right.directory().name_of(alice.server), Some("left.test"));
    assert_eq!(net.node("hub.test").state().user_count(), 1);

    assert!(net.sent("hub.test", "right.test").iter().any(|l| l.contains(" NICK ")));
    assert!(
        !net.sent("hub.test", "left.test").iter().any(|l| l.contains(" NICK ")),
        "hub echoed the introduction back"
    );
}

/// Squitting a direct peer removes its whole subtree everywhere, along with
/// every user behind it.
#[test]
fn squit_removes_the_subtree_and_its_users() {
    let names = ["hub.test", "b.test", "c.test", "d.test", "e.test"];
    let mut net = Net::new(&names);
    net.link("hub.test", "b.test");
    net.link("b.test", "c.test");
    net.link("c.test", "d.test");
    net.link("hub.test", "e.test");
    net.add_user("b.test", "bee", START);
    net.add_user("c.test", "sea", START);
    net.add_user("d.test", "dee", START);
    net.add_user("e.test", "eve", START);
    net.pump();

    let recorder = Recorder::default();
    recorder.attach(net.node_mut("e.test"));

    assert_eq!(net.node("e.test").state().user_count(), 4);
    assert_eq!(net.node("e.test").directory().by_name("d.test").unwrap().hops, 4);

    net.node_mut("hub.test").squit("b.test", "Maintenance").unwrap();
    net.pump();

    assert_eq!(net.servers_seen_by("hub.test"), vec!["e.test", "hub.test"]);
    assert_eq!(net.servers_seen_by("e.test"), vec!["e.test", "hub.test"]);
    assert_eq!(net.servers_seen_by("b.test"), vec!["b.test", "c.test", "d.test"]);

    for name in ["hub.test", "e.test"] {
        let state = net.node(name).state();
        assert_eq!(state.user_count(), 1, "{name} kept split users");
        assert!(state.user_by_nick("eve").is_some());
        assert_eq!(net.node(name).directory().global_users(), 1);
    }
    assert!(net.node("b.test").state().user_by_nick("eve").is_none());
    assert_eq!(net.node("b.test").state().user_count(), 3);

    assert!(recorder.contains("split b.test (Maintenance) servers=3 users=3"));
}

/// Only direct peers can be squit by an operator, and never ourselves.
#[test]
fn operator_squit_needs_a_direct_peer() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    net.link("b.test", "c.test");

    let a = net.node_mut("a.test");
    assert_eq!(a.squit("a.test", "x"), Err(OperError::SquitSelf));
    assert_eq!(
        a.squit("c.test", "x"),
        Err(OperError::NotDirectlyConnected("c.test".into()))
    );
    assert_eq!(
        a.squit("nowhere.test", "x"),
        Err(OperError::NoSuchServer("nowhere.test".into()))
    );
    assert_eq!(a.directory().len(), 3);
}

/// A socket that dies takes the peer's side of the tree with it.
#[test]
fn closed_socket_splits_both_sides() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    net.link("b.test", "c.test");
    net.add_user("c.test", "carol", START);
    net.pump();

    net.cut("a.test", "b.test");
    net.pump();

    assert_eq!(net.servers_seen_by("a.test"), vec!["a.test"]);
    assert_eq!(net.servers_seen_by("c.test"), vec!["b.test", "c.test"]);
    assert_eq!(net.node("a.test").state().user_count(), 0);
    assert_eq!(net.node("b.test").state().user_count(), 1);
}

/// A peer that stops answering PING is split after one interval.
#[test]
fn unanswered_ping_splits_the_peer() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    net.clear_wire();

    net.advance(120);
    net.tick("a.test");
    // Deliberately not pumped: b never sees the PING.
    net.advance(120);
    net.tick("a.test");

    assert_eq!(net.node("a.test").directory().len(), 1);
    net.pump();
    assert_eq!(net.node("b.test").directory().len(), 1);
}

/// A peer that answers PING stays linked, and the answer reaches hooks.
#[test]
fn answered_ping_keeps_the_link() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    net.clear_wire();

    for _ in 0..3 {
        net.advance(120);
        net.tick("a.test");
        net.pump();
    }
    assert_eq!(net.node("a.test").directory().len(), 2);
    let pings: Vec<String> = net.sent("a.test", "b.test");
    assert_eq!(pings.iter().filter(|l| l.contains("PING")).count(), 3);
    assert!(net.sent("b.test", "a.test").iter().all(|l| l.contains("PONG")));
}

/// Operator PING of a remote server travels the tree and the PONG comes
/// back to the asking server.
#[test]
fn remote_ping_crosses_the_tree() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    net.link("b.test", "c.test");
    let recorder = Recorder::default();
    recorder.attach(net.node_mut("a.test"));

    net.node_mut("a.test").remote_ping("c.test").unwrap();
    net.pump();
    assert!(recorder.contains("pong c.test"));
}

/// Links with a shared key run encrypted and still carry traffic.
#[test]
fn encrypted_link_carries_the_burst() {
    let mut net = Net::with_config(&["a.test", "b.test"], |config| {
        for block in &mut config.link {
            block.encryptionkey = Some("0123456789abcdef".to_string());
        }
    });
    net.add_user("b.test", "bob", START);
    net.link("a.test", "b.test");

    for name in ["a.test", "b.test"] {
        let tree = net.node(name);
        let conn = tree.connections().find(|c| c.is_connected()).expect("linked");
        assert!(conn.encrypted, "{name} link is not encrypted");
    }
    assert!(net.node("a.test").state().user_by_nick("bob").is_some());

    let b_lines = net.sent("b.test", "a.test");
    assert!(b_lines.iter().any(|l| l.starts_with("CAPAB")));
    assert!(
        b_lines.iter().filter(|l| !l.starts_with("CAPAB")).all(|l| !l.contains(' ')),
        "plaintext after AES: {b_lines:?}"
    );
}

/// A key on one side only is a failed link.
#[test]
fn missing_encryption_is_refused() {
    let mut net = Net::with_config(&["a.test", "b.test"], |config| {
        if config.server.name == "b.test" {
            for block in &mut config.link {
                block.encryptionkey = Some("0123456789abcdef".to_string());
            }
        }
    });
    net.link("a.test", "b.test");
    assert_eq!(net.node("a.test").directory().len(), 1);
    assert_eq!(net.node("b.test").directory().len(), 1);
    assert!(net.sent("b.test", "a.test").iter().any(|l| l.starts_with("ERROR")));
}

/// Bad passwords never reach CONNECTED.
#[test]
fn wrong_password_is_refused() {
    let mut net = Net::with_config(&["a.test", "b.test"], |config| {
        if config.server.name == "a.test" {
            config.link[0].sendpass = "guess".to_string();
        }
    });
    net.link("a.test", "b.test");
    assert_eq!(net.node("b.test").directory().len(), 1);
    assert_eq!(net.node("a.test").connections().count(), 0);
}

/// Mismatched CAPAB module lists abort the handshake.
#[test]
fn capab_mismatch_is_refused() {
    let mut net = Net::with_config(&["a.test", "b.test"], |config| {
        if config.server.name == "b.test" {
            config.protocol.common_modules.push("m_extra.so".to_string());
        }
    });
    net.link("a.test", "b.test");
    assert_eq!(net.node("a.test").directory().len(), 1);
    assert_eq!(net.node("b.test").directory().len(), 1);
}

/// MAP and LINKS reflect the tree; hidden link blocks stay out of LINKS.
#[test]
fn map_and_links_describe_the_tree() {
    let mut net = Net::with_config(&["hub.test", "b.test", "c.test"], |config| {
        for block in &mut config.link {
            block.hidden = block.name == "c.test";
        }
    });
    net.link("hub.test", "b.test");
    net.link("hub.test", "c.test");
    net.add_user("b.test", "bee", START);
    net.pump();

    let map = net.node("hub.test").map();
    assert_eq!(map.len(), 3);
    assert_eq!(map[0], "hub.test (0 users)");
    assert!(map.contains(&"  b.test (1 users)".to_string()));
    assert!(map.contains(&"  c.test (0 users)".to_string()));

    let links = net.node("hub.test").links();
    let names: Vec<&str> = links.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"hub.test"));
    assert!(names.contains(&"b.test"));
    let b = links.iter().find(|l| l.name == "b.test").unwrap();
    assert_eq!(b.parent, "hub.test");
    assert_eq!(b.hops, 1);
}

/// Remote CONNECT makes the named server dial out.
#[test]
fn rconnect_asks_the_remote_server_to_dial() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    net.add_user("a.test", "oper", START);
    net.pump();

    net.node_mut("a.test")
        .rconnect("oper", "c.test", "b.test")
        .unwrap();
    net.pump();

    assert!(
        net.node("b.test")
            .connections()
            .any(|c| c.record.as_deref() == Some("c.test") && !c.is_connected())
    );
}

/// TIME for a remote server is answered through the message hooks.
#[test]
fn remote_time_is_answered() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    net.add_user("a.test", "asker", START);
    net.pump();
    let recorder = Recorder::default();
    recorder.attach(net.node_mut("a.test"));

    assert_eq!(net.node_mut("a.test").remote_time("asker", "b.test"), Ok(None));
    net.pump();
    assert!(recorder.contains(&format!("time b.test for asker: {}", net.now())));
}

/// Shutdown squits every peer and the rest of the network notices.
#[test]
fn shutdown_splits_from_every_peer() {
    let mut net = Net::new(&["hub.test", "b.test", "c.test"]);
    net.link("hub.test", "b.test");
    net.link("hub.test", "c.test");

    net.node_mut("hub.test").shutdown("Server shutting down");
    net.pump();

    assert_eq!(net.node("hub.test").connections().count(), 0);
    assert_eq!(net.servers_seen_by("b.test"), vec!["b.test"]);
    assert_eq!(net.servers_seen_by("c.test"), vec!["c.test"]);
}

/// A SERVER line naming a server already in the tree is fatal for the
/// link it came in on, and the duplicate never enters the directory.
#[test]
fn server_introduced_twice_on_the_wire_drops_the_link() {
    let mut net = Net::new(&["hub.test", "b.test", "c.test"]);
    net.link("hub.test", "b.test");
    net.link("hub.test", "c.test");
    net.clear_wire();

    net.inject("b.test", "hub.test", ":b.test SERVER c.test * 1 :Impostor");
    net.pump();

    assert!(
        net.sent("hub.test", "b.test").iter().any(|l| l.starts_with("ERROR") && l.contains("c.test")),
        "no ERROR for the duplicate"
    );
    let hub = net.node("hub.test");
    assert!(hub.directory().find("b.test").is_none());
    let c = hub.directory().find("c.test").expect("c.test kept");
    assert_eq!(hub.directory().route_of(c), Some(c));
    assert_eq!(net.servers_seen_by("hub.test"), vec!["c.test", "hub.test"]);
}

/// A line whose origin lives behind another link is dropped without
/// hurting the link it arrived on.
#[test]
fn lines_from_the_wrong_direction_are_dropped() {
    let mut net = Net::new(&["hub.test", "left.test", "right.test"]);
    net.link("hub.test", "left.test");
    net.link("hub.test", "right.test");
    net.clear_wire();

    net.inject(
        "left.test",
        "hub.test",
        &format!(":right.test NICK {START} mallory m.host m.host evil +i 192.0.2.66 :Spoofed"),
    );
    net.pump();

    assert!(net.node("hub.test").state().user_by_nick("mallory").is_none());
    assert!(net.node("right.test").state().user_by_nick("mallory").is_none());
    assert!(net.node("hub.test").directory().find("left.test").is_some());
    assert!(net.sent("hub.test", "left.test").iter().all(|l| !l.starts_with("ERROR")));
}

/// Commands this server does not understand still reach every other
/// server, and never go back where they came from.
#[test]
fn unknown_commands_are_relayed_to_everyone_else() {
    let mut net = Net::new(&["hub.test", "left.test", "right.test", "far.test"]);
    net.link("hub.test", "left.test");
    net.link("hub.test", "right.test");
    net.link("right.test", "far.test");
    net.clear_wire();

    net.inject("left.test", "hub.test", ":left.test SVSWATCH alice :watch list");
    net.pump();

    for (from, to) in [("hub.test", "right.test"), ("right.test", "far.test")] {
        assert_eq!(
            net.sent(from, to),
            vec![":left.test SVSWATCH alice :watch list".to_string()],
            "{from} -> {to}"
        );
    }
    assert!(net.sent("hub.test", "left.test").is_empty());
}

/// Once AES is up, a plaintext protocol line is refused and the link with it.
#[test]
fn plaintext_on_an_encrypted_link_is_refused() {
    let mut net = Net::with_config(&["a.test", "b.test"], |config| {
        for block in &mut config.link {
            block.encryptionkey = Some("0123456789abcdef".to_string());
        }
    });
    net.link("a.test", "b.test");
    let hooks = Recorder::default();
    hooks.attach(net.node_mut("a.test"));

    net.inject(
        "b.test",
        "a.test",
        ":b.test NICK 1000 mallory h h i +i 192.0.2.66 :Plain text",
    );
    net.pump();

    assert!(net.node("a.test").state().user_by_nick("mallory").is_none());
    assert_eq!(net.node("a.test").directory().len(), 1);
    assert!(hooks.contains("plaintext NICK on an encrypted link"));
}

/// A BURST timestamp at the edge of the integer range is fatal skew, not a
/// crash.
#[test]
fn extreme_burst_timestamp_splits_the_peer() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    net.clear_wire();

    net.inject("b.test", "a.test", "BURST -9223372036854775808");
    net.pump();

    assert_eq!(net.node("a.test").directory().len(), 1);
    assert!(
        net.sent("a.test", "b.test").iter().any(|l| l.starts_with("ERROR") && l.contains("clock skew")),
        "no ERROR for the skewed BURST"
    );
}
