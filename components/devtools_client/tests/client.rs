/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use rdp_client::{Client, Front};
use rdp_protocol::transport::channel_transport;
use rdp_protocol::{ErrorCode, SPECS};
use rdp_server::{
    ConnectionHandle, Debuggee, DebuggeeError, DebuggeeEvent, ServerOptions, TabInfo, TargetInfo,
    open_connection,
};
use serde_json::{Value, json};

const FAVICON: &str = "data:image/png;base64,iVBORw0KGgo=";

struct Browser;

impl Debuggee for Browser {
    fn tabs(&self) -> Vec<TabInfo> {
        vec![TabInfo {
            browser_id: 1,
            browsing_context_id: 1,
            outer_window_id: 1,
            url: "https://servo.org/".to_owned(),
            title: "Servo".to_owned(),
            selected: true,
        }]
    }

    fn attach(&self, _browser_id: u32) -> Result<TargetInfo, DebuggeeError> {
        Ok(TargetInfo {
            browsing_context_id: 1,
            outer_window_id: 1,
            url: "https://servo.org/".to_owned(),
            title: "Servo".to_owned(),
        })
    }

    fn detach(&self, _browser_id: u32) {}

    fn navigate(&self, _browser_id: u32, _url: &str) -> Result<(), DebuggeeError> {
        Ok(())
    }

    fn reload(&self, _browser_id: u32, _bypass_cache: bool) -> Result<(), DebuggeeError> {
        Ok(())
    }

    fn favicon(&self, _browser_id: u32) -> Option<String> {
        Some(FAVICON.to_owned())
    }

    fn parent_browsing_context(&self, _browsing_context_id: u64) -> Option<u64> {
        None
    }
}

fn connect() -> (Client, ConnectionHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_end, server_end) = channel_transport();
    let handle = open_connection(
        Box::new(server_end.sink),
        Box::new(server_end.source),
        Arc::new(Browser),
        &ServerOptions::default(),
    );
    let client = Client::connect(
        Box::new(client_end.sink),
        Box::new(client_end.source),
        &SPECS,
    )
    .unwrap();
    (client, handle)
}

fn first_tab(client: &Client) -> Front {
    let payload = client.root().call("listTabs", &[]).unwrap().wait().unwrap();
    payload.fronts("tabs").remove(0)
}

fn raw(to: &str, request_type: &str) -> serde_json::Map<String, Value> {
    let packet = json!({"to": to, "type": request_type});
    packet.as_object().unwrap().clone()
}

#[test]
fn favicon() {
    let (client, _handle) = connect();
    assert_eq!(client.greeting()["applicationType"], "browser");
    let tab = first_tab(&client);
    assert_eq!(tab.type_name(), "tabDescriptor");
    assert_eq!(tab.form().unwrap()["title"], "Servo");

    let payload = tab.call("getFavicon", &[]).unwrap().wait().unwrap();
    assert_eq!(payload.parse::<String>("favicon").unwrap(), FAVICON);
}

#[test]
fn unknown_methods_are_rejected_by_the_server() {
    let (client, _handle) = connect();
    let tab = first_tab(&client);
    let error = client
        .request(raw(tab.actor_id(), "bogusMethod"))
        .unwrap()
        .wait()
        .unwrap_err();
    assert_eq!(error.error, ErrorCode::UnrecognizedPacketType);

    // The connection is still usable.
    assert!(tab.call("getFavicon", &[]).unwrap().wait().is_ok());
}

#[test]
fn slow_replies_are_not_overtaken() {
    let (client, handle) = connect();
    let tab = first_tab(&client);

    let navigation = tab
        .call(
            "navigateTo",
            &[json!("https://servo.org/slow"), json!({"waitForLoad": true})],
        )
        .unwrap();
    let favicon = tab.call("getFavicon", &[]).unwrap();
    // Another actor answers while the tab is busy.
    client.root().call("listTabs", &[]).unwrap().wait().unwrap();
    assert!(navigation.try_wait().is_none());
    assert!(favicon.try_wait().is_none());

    assert!(handle.notify(1, DebuggeeEvent::NavigationStop {
        url: "https://servo.org/slow".to_owned(),
        title: "Slow".to_owned(),
        process_swap: false,
    }));
    assert!(navigation.wait().unwrap().values().is_empty());
    assert_eq!(favicon.wait().unwrap().get("favicon"), Some(&json!(FAVICON)));
}

#[test]
fn watcher_events_bring_new_fronts() {
    let (client, _handle) = connect();
    let tab = first_tab(&client);
    let watcher = tab
        .call("getWatcher", &[json!({"isServerTargetSwitchingEnabled": true})])
        .unwrap()
        .wait()
        .unwrap()
        .front("watcher")
        .unwrap();

    let (sender, receiver) = unbounded();
    watcher
        .on("target-available-form", move |payload| {
            let _ = sender.send(payload.front("target"));
        })
        .unwrap();
    watcher
        .call("watchTargets", &[json!("frame")])
        .unwrap()
        .wait()
        .unwrap();

    let target = receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(target.type_name(), "windowGlobalTarget");
    target
        .call("reload", &[json!({"bypassCache": true})])
        .unwrap()
        .wait()
        .unwrap();

    // An actor where a number is expected is refused before sending.
    let error = watcher
        .call("getParentBrowsingContextID", &[Value::from(&target)])
        .unwrap_err();
    assert_eq!(error.error, ErrorCode::BadParameterType);
}

#[test]
fn listeners_can_call_the_server() {
    let (client, _handle) = connect();
    let tab = first_tab(&client);
    let watcher = tab
        .call("getWatcher", &[json!({"isServerTargetSwitchingEnabled": true})])
        .unwrap()
        .wait()
        .unwrap()
        .front("watcher")
        .unwrap();

    let (sender, receiver) = unbounded();
    let listener_watcher = watcher.clone();
    watcher
        .on("target-available-form", move |payload| {
            let Some(target) = payload.front("target") else {
                return;
            };
            let parent = listener_watcher
                .call("getParentBrowsingContextID", &[json!(1)])
                .and_then(|reply| reply.wait());
            let reloaded = target.call("reload", &[]).and_then(|reply| reply.wait());
            let _ = sender.send((parent.is_ok(), reloaded.is_ok()));
        })
        .unwrap();
    watcher
        .call("watchTargets", &[json!("frame")])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(
        receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
        (true, true)
    );
}

#[test]
fn released_fronts_are_destroyed() {
    let (client, _handle) = connect();
    let tab = first_tab(&client);
    let target = tab
        .call("getTarget", &[])
        .unwrap()
        .wait()
        .unwrap()
        .front("frame")
        .unwrap();
    let watcher = tab
        .call("getWatcher", &[])
        .unwrap()
        .wait()
        .unwrap()
        .front("watcher")
        .unwrap();

    tab.call("detach", &[]).unwrap().wait().unwrap();
    assert!(tab.is_destroyed());
    assert!(target.is_destroyed());
    assert!(watcher.is_destroyed());
    let error = tab.call("getFavicon", &[]).unwrap_err();
    assert_eq!(error.error, ErrorCode::NoSuchActor);

    let error = target.call("reload", &[]).unwrap_err();
    assert_eq!(error.error, ErrorCode::NoSuchActor);

    // The server forgot the descriptor and its target too.
    for actor in [tab.actor_id(), target.actor_id()] {
        let error = client
            .request(raw(actor, "getFavicon"))
            .unwrap()
            .wait()
            .unwrap_err();
        assert_eq!(error.error, ErrorCode::NoSuchActor);
    }

    tab.destroy();
    tab.destroy();
    assert!(tab.is_destroyed());
}

#[test]
fn closed_tabs_destroy_their_fronts() {
    let (client, handle) = connect();
    let tab = first_tab(&client);
    let (sender, receiver) = unbounded();
    tab.on("descriptor-destroyed", move |_| {
        let _ = sender.send(());
    })
    .unwrap();

    assert!(handle.notify(1, DebuggeeEvent::TabClosed));
    receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(tab.is_destroyed());
    assert!(client.front(tab.actor_id()).is_none());
}

#[test]
fn protocol_description() {
    let (client, _handle) = connect();
    let payload = client
        .root()
        .call("protocolDescription", &[])
        .unwrap()
        .wait()
        .unwrap();
    let types = payload.get("types").unwrap();
    assert_eq!(types["watcher"]["typeName"], "watcher");
}

#[test]
fn closing_the_server_rejects_pending_calls() {
    let (client, handle) = connect();
    let tab = first_tab(&client);
    let navigation = tab
        .call("navigateTo", &[json!("about:blank"), json!({"waitForLoad": true})])
        .unwrap();
    client.root().call("listTabs", &[]).unwrap().wait().unwrap();

    handle.close();
    let error = navigation.wait().unwrap_err();
    assert_eq!(error.error, ErrorCode::ConnectionClosed);
    handle.join();
    assert!(client.is_closed());
}

#[test]
fn closing_the_client_rejects_pending_calls() {
    let (client, _handle) = connect();
    let tab = first_tab(&client);
    let navigation = tab
        .call("navigateTo", &[json!("about:blank"), json!({"waitForLoad": true})])
        .unwrap();
    client.close();
    assert_eq!(
        navigation.wait().unwrap_err().error,
        ErrorCode::ConnectionClosed
    );
    assert_eq!(
        tab.call("getFavicon", &[]).unwrap_err().error,
        ErrorCode::ConnectionClosed
    );
}
