//! Merging two halves of a network: bursts, TS arbitration, collisions
//! and x-lines.

mod common;

use common::{Net, Recorder, START};
use treelink_proto::{Command, Message, ModeChange};
use treelinkd::state::{XLine, XLineKind};
use treelinkd::sync::ServerId;

fn is_op(net: &Net, server: &str, channel: &str, nick: &str) -> bool {
    let state = net.node(server).state();
    let uid = state.find_nick(nick).expect("nick known");
    state
        .channel(channel)
        .and_then(|c| c.members.get(&uid))
        .is_some_and(|m| m.op)
}

/// The burst for a given state is the same every time it is generated.
#[test]
fn burst_is_deterministic() {
    let mut net = Net::new(&["a.test", "b.test"]);
    let alice = net.add_user("a.test", "alice", START);
    let bob = net.add_user("a.test", "bob", START + 1);
    let tree = net.node_mut("a.test");
    tree.join_local(alice, "#rust").unwrap();
    tree.join_local(bob, "#rust").unwrap();
    tree.join_local(bob, "#tokio").unwrap();
    tree.set_topic(alice, "#rust", "ownership").unwrap();
    tree.add_xline(XLine::new(XLineKind::G, "*@spam.test", "alice", START, 0, "spam"));
    tree.set_metadata("*", "motd", "hello").unwrap();

    let peer = ServerId(u64::MAX);
    let first: Vec<String> = tree.burst_lines(peer).iter().map(Message::to_string).collect();
    let second: Vec<String> = tree.burst_lines(peer).iter().map(Message::to_string).collect();
    assert_eq!(first, second);

    assert!(first[0].starts_with("BURST "));
    assert_eq!(first.last().map(String::as_str), Some("ENDBURST"));
    let fjoins: Vec<&String> = first.iter().filter(|l| l.contains(" FJOIN ")).collect();
    assert_eq!(fjoins.len(), 2);
    assert!(fjoins[0].contains("#rust"));
    assert!(first.iter().any(|l| l.contains(" ADDLINE G *@spam.test ")));
    assert!(first.iter().any(|l| l.contains(" FTOPIC #rust ")));
}

/// After a merge both sides hold the same users and channels, and nothing
/// is duplicated.
#[test]
fn burst_replicates_state_once() {
    let mut net = Net::new(&["a.test", "b.test"]);
    let alice = net.add_user("a.test", "alice", START);
    net.node_mut("a.test").join_local(alice, "#rust").unwrap();
    let bob = net.add_user("b.test", "bob", START);
    net.node_mut("b.test").join_local(bob, "#rust").unwrap();

    net.link("a.test", "b.test");

    for name in ["a.test", "b.test"] {
        let state = net.node(name).state();
        assert_eq!(state.user_count(), 2);
        let chan = state.channel("#rust").expect("channel merged");
        assert_eq!(chan.members.len(), 2);
        assert_eq!(chan.ts, START);
        assert_eq!(net.node(name).directory().global_users(), 2);
    }
}

/// The older channel wins: its TS survives on both sides and only its
/// members keep their privileges.
#[test]
fn fjoin_merge_converges_on_the_older_channel() {
    let mut net = Net::new(&["a.test", "b.test"]);
    let alice = net.add_user("a.test", "alice", START);
    net.node_mut("a.test").join_local(alice, "#x").unwrap();

    net.advance(500);
    let bob = net.add_user("b.test", "bob", START);
    net.node_mut("b.test").join_local(bob, "#x").unwrap();
    assert_eq!(net.node("b.test").state().channel("#x").unwrap().ts, START + 500);

    net.link("a.test", "b.test");

    for name in ["a.test", "b.test"] {
        assert_eq!(net.node(name).state().channel("#x").unwrap().ts, START);
        assert!(is_op(&net, name, "#x", "alice"), "alice lost ops on {name}");
        assert!(!is_op(&net, name, "#x", "bob"), "bob kept ops on {name}");
    }

    let bounce = format!(":a.test FMODE #x {START} -o bob");
    assert!(net.sent("a.test", "b.test").contains(&bounce));
}

/// A U-lined server wins the FJOIN comparison even with a newer TS.
#[test]
fn ulined_server_keeps_its_privileges() {
    let mut net = Net::with_config(&["a.test", "services.test"], |config| {
        config.ulines.push("services.test".to_string());
    });
    let alice = net.add_user("a.test", "alice", START);
    net.node_mut("a.test").join_local(alice, "#x").unwrap();
    net.advance(500);
    let chanserv = net.add_user("services.test", "ChanServ", START);
    net.node_mut("services.test").join_local(chanserv, "#x").unwrap();

    net.link("a.test", "services.test");

    assert!(is_op(&net, "a.test", "#x", "ChanServ"));
    assert!(is_op(&net, "services.test", "#x", "ChanServ"));
}

/// Same nick on both sides of a merge: both users die everywhere.
#[test]
fn nick_collision_kills_both_users() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.add_user("a.test", "alice", START);
    net.add_user("b.test", "alice", START + 100);
    net.add_user("b.test", "bystander", START);
    let a_hooks = Recorder::default();
    a_hooks.attach(net.node_mut("a.test"));
    let b_hooks = Recorder::default();
    b_hooks.attach(net.node_mut("b.test"));

    net.link("a.test", "b.test");

    for name in ["a.test", "b.test"] {
        let state = net.node(name).state();
        assert!(state.user_by_nick("alice").is_none(), "alice survived on {name}");
        assert!(state.user_by_nick("bystander").is_some());
        assert_eq!(state.user_count(), 1);
    }
    assert!(a_hooks.contains("killed alice: Nickname collision"));
    assert!(b_hooks.contains("killed alice: Nickname collision"));
}

/// A rename onto a taken nick kills both the renaming user and the holder.
#[test]
fn rename_collision_kills_both_users() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    let carol = net.add_user("a.test", "carol", START);
    net.add_user("b.test", "dave", START);
    net.pump();

    // b renamed someone to carol before hearing about a's carol.
    net.inject("b.test", "a.test", ":dave NICK carol");
    net.pump();

    assert!(net.node("a.test").state().user(carol).is_none());
    for name in ["a.test", "b.test"] {
        let state = net.node(name).state();
        assert!(state.user_by_nick("carol").is_none(), "carol survived on {name}");
        assert!(state.user_by_nick("dave").is_none(), "dave survived on {name}");
    }
}

/// A mode change stamped with a TS no older than ours is applied.
#[test]
fn fmode_with_newer_ts_is_applied() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    let alice = net.add_user("a.test", "alice", START);
    let tree = net.node_mut("a.test");
    tree.join_local(alice, "#m").unwrap();
    tree.local_mode("alice", "#m", &[ModeChange::plus('m', None)])
        .unwrap();
    net.pump();
    assert!(net.node("b.test").state().channel("#m").unwrap().modes.flags.contains(&'m'));

    net.inject("b.test", "a.test", &format!(":b.test FMODE #m {} -m+s", START + 100));
    net.pump();

    let modes = &net.node("a.test").state().channel("#m").unwrap().modes;
    assert!(!modes.flags.contains(&'m'));
    assert!(modes.flags.contains(&'s'));
}

/// A mode change stamped with an older TS is bounced back to the sending
/// link only, carrying our state for each touched mode.
#[test]
fn fmode_with_older_ts_is_bounced() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    net.link("a.test", "c.test");
    let alice = net.add_user("a.test", "alice", START);
    let tree = net.node_mut("a.test");
    tree.join_local(alice, "#m").unwrap();
    tree.local_mode("alice", "#m", &[ModeChange::plus('m', None)])
        .unwrap();
    net.pump();
    net.clear_wire();

    net.inject("b.test", "a.test", &format!(":b.test FMODE #m {} -m+s", START - 100));
    net.pump();

    let modes = &net.node("a.test").state().channel("#m").unwrap().modes;
    assert!(modes.flags.contains(&'m'));
    assert!(!modes.flags.contains(&'s'));

    let sent = net.sent("a.test", "b.test");
    assert_eq!(sent.len(), 1);
    let msg: Message = sent[0].parse().unwrap();
    assert_eq!(msg.prefix.as_deref(), Some("a.test"));
    match Command::parse(&msg).unwrap() {
        Command::Fmode {
            target, ts, modes, ..
        } => {
            assert_eq!(target, "#m");
            assert_eq!(ts, START);
            assert_eq!(modes, "+m-s");
        }
        other => panic!("expected FMODE, got {other:?}"),
    }
    assert!(net.sent("a.test", "c.test").is_empty(), "bounce leaked to c");
}

/// FTOPIC with an older TS than our topic is ignored; a newer one wins.
#[test]
fn ftopic_keeps_the_newer_topic() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    let alice = net.add_user("a.test", "alice", START);
    let tree = net.node_mut("a.test");
    tree.join_local(alice, "#t").unwrap();
    tree.set_topic(alice, "#t", "first").unwrap();
    net.pump();
    assert_eq!(
        net.node("b.test").state().channel("#t").unwrap().topic.as_ref().unwrap().text,
        "first"
    );

    net.inject("b.test", "a.test", &format!(":b.test FTOPIC #t {} old :stale", START - 10));
    net.pump();
    let topic = net.node("a.test").state().channel("#t").unwrap().topic.clone().unwrap();
    assert_eq!(topic.text, "first");

    net.inject("b.test", "a.test", &format!(":b.test FTOPIC #t {} bob :fresh", START + 10));
    net.pump();
    let topic = net.node("a.test").state().channel("#t").unwrap().topic.clone().unwrap();
    assert_eq!(topic.text, "fresh");
    assert_eq!(topic.set_by, "bob");
}

/// A G-line received during the burst waits for ENDBURST, then removes the
/// matching local user and the removal reaches the rest of the network.
#[test]
fn burst_xline_is_enforced_after_endburst() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.node_mut("a.test").add_xline(XLine::new(
        XLineKind::G,
        "*@evil.users.test",
        "oper",
        START,
        0,
        "No evil",
    ));
    net.add_user("b.test", "evil", START);
    net.add_user("b.test", "good", START);
    let hooks = Recorder::default();
    hooks.attach(net.node_mut("b.test"));

    net.link("a.test", "b.test");

    let b = net.node("b.test").state();
    let line = b.xlines.get(XLineKind::G, "*@evil.users.test").expect("line replicated");
    assert!(!line.pending);
    assert!(b.user_by_nick("evil").is_none());
    assert!(b.user_by_nick("good").is_some());
    assert!(net.node("a.test").state().user_by_nick("evil").is_none());
    assert!(hooks.contains("killed evil: G-Lined: No evil"));

    let b_lines = net.sent("b.test", "a.test");
    let endburst = b_lines.iter().position(|l| l == "ENDBURST").unwrap();
    let quit = b_lines.iter().position(|l| l.starts_with(":evil QUIT")).unwrap();
    assert!(quit > endburst);
}

/// Outside a burst a new x-line is enforced at once, and DELLINE lifts it.
#[test]
fn live_xline_add_and_remove() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    net.add_user("b.test", "evil", START);
    net.pump();

    net.node_mut("a.test").add_xline(XLine::new(
        XLineKind::Q,
        "evil",
        "oper",
        START,
        3600,
        "Reserved nick",
    ));
    net.pump();
    assert!(net.node("b.test").state().user_by_nick("evil").is_none());
    assert!(net.node("a.test").state().user_by_nick("evil").is_none());

    assert!(net.node_mut("a.test").remove_xline(XLineKind::Q, "evil"));
    net.pump();
    assert!(net.node("b.test").state().xlines.get(XLineKind::Q, "evil").is_none());
    net.add_user("b.test", "evil", START);
}

/// Timed x-lines disappear once their duration has passed.
#[test]
fn xlines_expire_on_tick() {
    let mut net = Net::new(&["a.test"]);
    net.node_mut("a.test").add_xline(XLine::new(
        XLineKind::Z,
        "203.0.113.*",
        "oper",
        START,
        60,
        "Flood",
    ));
    net.advance(59);
    net.tick("a.test");
    assert!(net.node("a.test").state().xlines.get(XLineKind::Z, "203.0.113.*").is_some());
    net.advance(1);
    net.tick("a.test");
    assert!(net.node("a.test").state().xlines.get(XLineKind::Z, "203.0.113.*").is_none());
}

/// A line whose expiry lies past the end of the clock stays and never
/// trips the expiry sweep.
#[test]
fn xline_expiring_beyond_the_clock_is_kept() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");

    net.inject(
        "b.test",
        "a.test",
        &format!(":b.test ADDLINE G *@evil b.test {} 10 :Forever", i64::MAX),
    );
    net.pump();
    net.advance(3600);
    net.tick("a.test");

    let line = net.node("a.test").state().xlines.get(XLineKind::G, "*@evil").cloned();
    assert_eq!(line.and_then(|l| l.expires_at()), None);
    assert!(net.node("a.test").directory().find("b.test").is_some());
}

/// A negative ADDLINE duration is malformed and costs the sender its link.
#[test]
fn negative_xline_duration_is_refused() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");

    net.inject("b.test", "a.test", &format!(":b.test ADDLINE G *@evil b.test {START} -10 :Back"));
    net.pump();

    assert!(net.node("a.test").state().xlines.is_empty());
    assert!(net.node("a.test").directory().find("b.test").is_none());
}

/// An ADDLINE of a type we do not know is reported and not stored.
#[test]
fn unknown_line_type_is_reported() {
    let mut net = Net::new(&["a.test", "b.test"]);
    net.link("a.test", "b.test");
    let hooks = Recorder::default();
    hooks.attach(net.node_mut("a.test"));

    net.inject("b.test", "a.test", &format!(":b.test ADDLINE X *@x b {START} 0 :odd"));
    net.pump();

    assert!(net.node("a.test").state().xlines.is_empty());
    assert!(hooks.events().iter().any(|e| e.starts_with("snotice") && e.contains('X')));
    assert!(net.node("a.test").directory().find("b.test").is_some());
}

/// Channel messages reach only servers with members, once each.
#[test]
fn channel_messages_follow_membership() {
    let mut net = Net::new(&["hub.test", "left.test", "right.test"]);
    net.link("hub.test", "left.test");
    net.link("hub.test", "right.test");
    let speaker = net.add_user("left.test", "speaker", START);
    let listener = net.add_user("hub.test", "listener", START);
    net.add_user("right.test", "outsider", START);
    net.node_mut("left.test").join_local(speaker, "#talk").unwrap();
    net.node_mut("hub.test").join_local(listener, "#talk").unwrap();
    net.pump();
    let hooks = Recorder::default();
    hooks.attach(net.node_mut("hub.test"));
    net.clear_wire();

    net.node_mut("left.test")
        .send_message(speaker, "#talk", "hello", false)
        .unwrap();
    net.pump();

    assert!(hooks.contains("privmsg speaker -> listener (#talk): hello"));
    assert!(
        !net.sent("hub.test", "right.test").iter().any(|l| l.contains("PRIVMSG")),
        "message sent to a server without members"
    );
}

/// Metadata set on a channel is replicated and part of later bursts.
#[test]
fn metadata_travels_with_the_burst() {
    let mut net = Net::new(&["a.test", "b.test", "c.test"]);
    net.link("a.test", "b.test");
    let alice = net.add_user("a.test", "alice", START);
    net.node_mut("a.test").join_local(alice, "#meta").unwrap();
    net.node_mut("a.test")
        .set_metadata("#meta", "url", "https://example.test")
        .unwrap();
    net.pump();
    assert_eq!(
        net.node("b.test").state().channel("#meta").unwrap().metadata.get("url").map(String::as_str),
        Some("https://example.test")
    );

    net.link("b.test", "c.test");
    assert_eq!(
        net.node("c.test").state().channel("#meta").unwrap().metadata.get("url").map(String::as_str),
        Some("https://example.test")
    );
}
