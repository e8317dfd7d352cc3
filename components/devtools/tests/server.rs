/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;
use std::io::BufReader;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rdp_protocol::transport::{ChannelTransport, JsonPacketStream, channel_transport, read_json_packet};
use rdp_protocol::{PacketSink, PacketSource};
use rdp_server::{
    ConnectionHandle, Debuggee, DebuggeeError, DebuggeeEvent, ServerControlMsg, ServerOptions,
    TabInfo, TargetInfo, open_connection, start_server,
};
use serde_json::{Value, json};

struct MockDebuggee {
    tabs: Vec<TabInfo>,
    refuse_attach: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockDebuggee {
    fn new() -> Arc<MockDebuggee> {
        let tab = |browser_id: u32, url: &str, title: &str, selected: bool| TabInfo {
            browser_id,
            browsing_context_id: browser_id as u64 * 10,
            outer_window_id: browser_id as u64 * 100,
            url: url.to_owned(),
            title: title.to_owned(),
            selected,
        };
        Arc::new(MockDebuggee {
            tabs: vec![
                tab(1, "https://example.com/", "Example", false),
                tab(2, "https://servo.org/", "Servo", true),
            ],
            refuse_attach: AtomicBool::new(false),
            calls: Mutex::new(vec![]),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

impl Debuggee for MockDebuggee {
    fn tabs(&self) -> Vec<TabInfo> {
        self.tabs.clone()
    }

    fn attach(&self, browser_id: u32) -> Result<TargetInfo, DebuggeeError> {
        self.record(format!("attach {browser_id}"));
        if self.refuse_attach.load(Ordering::SeqCst) {
            return Err(DebuggeeError::new("wrongState", "The page is not ready"));
        }
        let tab = self
            .tabs
            .iter()
            .find(|tab| tab.browser_id == browser_id)
            .ok_or_else(|| DebuggeeError::new("noTab", "No such tab"))?;
        Ok(TargetInfo {
            browsing_context_id: tab.browsing_context_id,
            outer_window_id: tab.outer_window_id,
            url: tab.url.clone(),
            title: tab.title.clone(),
        })
    }

    fn detach(&self, browser_id: u32) {
        self.record(format!("detach {browser_id}"));
    }

    fn navigate(&self, browser_id: u32, url: &str) -> Result<(), DebuggeeError> {
        self.record(format!("navigate {browser_id} {url}"));
        Ok(())
    }

    fn reload(&self, browser_id: u32, bypass_cache: bool) -> Result<(), DebuggeeError> {
        self.record(format!("reload {browser_id} {bypass_cache}"));
        Ok(())
    }

    fn favicon(&self, browser_id: u32) -> Option<String> {
        Some(format!("data:image/png;base64,{browser_id}"))
    }

    fn parent_browsing_context(&self, browsing_context_id: u64) -> Option<u64> {
        (browsing_context_id == 15).then_some(10)
    }
}

struct TestClient {
    transport: ChannelTransport,
    handle: ConnectionHandle,
    debuggee: Arc<MockDebuggee>,
    greeting: Value,
}

impl TestClient {
    fn connect() -> TestClient {
        let _ = env_logger::builder().is_test(true).try_init();
        let debuggee = MockDebuggee::new();
        let (mut client, server) = channel_transport();
        let handle = open_connection(
            Box::new(server.sink),
            Box::new(server.source),
            debuggee.clone(),
            &ServerOptions::default(),
        );
        let greeting = client.source.recv_packet().unwrap().unwrap();
        TestClient {
            transport: client,
            handle,
            debuggee,
            greeting,
        }
    }

    fn send(&mut self, packet: Value) {
        self.transport
            .sink
            .send_packet(packet.as_object().unwrap())
            .unwrap();
    }

    fn next(&mut self) -> Value {
        self.transport.source.recv_packet().unwrap().unwrap()
    }

    fn request(&mut self, packet: Value) -> Value {
        self.send(packet);
        self.next()
    }

    fn notify(&self, browser_id: u32, event: DebuggeeEvent) {
        assert!(self.handle.notify(browser_id, event));
    }

    /// The descriptor of the tab with the given browser ID.
    fn descriptor(&mut self, browser_id: u32) -> String {
        let reply = self.request(json!({"to": "root", "type": "getTab", "browserId": browser_id}));
        name(&reply["tab"])
    }
}

fn name(form: &Value) -> String {
    form["actor"].as_str().unwrap().to_owned()
}

#[test]
fn greeting_comes_from_root() {
    let client = TestClient::connect();
    assert_eq!(client.greeting["from"], "root");
    assert_eq!(client.greeting["applicationType"], "browser");
    assert!(client.greeting["traits"].is_object());
}

#[test]
fn list_tabs_returns_descriptor_forms() {
    let mut client = TestClient::connect();
    let reply = client.request(json!({"to": "root", "type": "listTabs"}));
    assert_eq!(reply["from"], "root");
    let tabs = reply["tabs"].as_array().unwrap();
    assert_eq!(tabs.len(), 2);

    let first = &tabs[0];
    assert!(name(first).starts_with("tabDescriptor"));
    assert_eq!(first["browserId"], 1);
    assert_eq!(first["browsingContextID"], 10);
    assert_eq!(first["outerWindowID"], 100);
    assert_eq!(first["url"], "https://example.com/");
    assert_eq!(first["title"], "Example");
    assert_eq!(first["selected"], false);
    assert_eq!(first["traits"]["watcher"], true);
    assert_eq!(tabs[1]["selected"], true);

    let again = client.request(json!({"to": "root", "type": "listTabs"}));
    let names = |reply: &Value| -> Vec<String> {
        reply["tabs"].as_array().unwrap().iter().map(name).collect()
    };
    assert_eq!(names(&reply), names(&again));
}

#[test]
fn get_tab_by_browser_id_or_selection() {
    let mut client = TestClient::connect();
    let listed = client.request(json!({"to": "root", "type": "listTabs"}));

    let reply = client.request(json!({"to": "root", "type": "getTab", "browserId": 1}));
    assert_eq!(reply["tab"]["actor"], listed["tabs"][0]["actor"]);

    let reply = client.request(json!({"to": "root", "type": "getTab"}));
    assert_eq!(reply["tab"]["browserId"], 2);

    let reply = client.request(json!({"to": "root", "type": "getTab", "browserId": 9}));
    assert_eq!(reply["from"], "root");
    assert_eq!(reply["error"], "noTab");

    let reply = client.request(json!({"to": "root", "type": "getTab", "browserId": "one"}));
    assert_eq!(reply["error"], "badParameterType");
}

#[test]
fn targets_are_attached_once() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);

    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    let frame = &reply["frame"];
    let target = name(frame);
    assert!(target.starts_with("windowGlobalTarget"));
    assert_eq!(frame["browsingContextID"], 10);
    assert_eq!(frame["isTopLevelTarget"], true);
    assert_eq!(frame["url"], "https://example.com/");

    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    assert_eq!(name(&reply["frame"]), target);
    assert_eq!(client.debuggee.count("attach"), 1);

    let reply = client.request(json!({"to": target, "type": "reload", "bypassCache": true}));
    assert_eq!(reply, json!({"from": target}));
    assert!(client.debuggee.calls().contains(&"reload 1 true".to_owned()));
}

#[test]
fn failed_attach_keeps_the_connection() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(2);
    client.debuggee.refuse_attach.store(true, Ordering::SeqCst);

    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    assert_eq!(
        reply,
        json!({"from": descriptor, "error": "wrongState", "message": "The page is not ready"})
    );

    client.debuggee.refuse_attach.store(false, Ordering::SeqCst);
    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    assert!(name(&reply["frame"]).starts_with("windowGlobalTarget"));
}

#[test]
fn favicon_is_sent_once_ready() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(2);
    let reply = client.request(json!({"to": descriptor, "type": "getFavicon"}));
    assert_eq!(
        reply,
        json!({"from": descriptor, "favicon": "data:image/png;base64,2"})
    );
}

#[test]
fn watcher_reports_targets_and_documents() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);

    let reply = client.request(json!({"to": descriptor, "type": "getWatcher", "isPopupDebuggingEnabled": false}));
    let watcher = name(&reply["watcher"]);
    assert_eq!(reply["watcher"]["traits"]["resources"]["document-event"], true);

    let reply = client.request(json!({"to": watcher, "type": "watchTargets", "targetType": "frame"}));
    assert_eq!(reply, json!({"from": watcher}));
    let event = client.next();
    assert_eq!(event["from"], watcher.as_str());
    assert_eq!(event["type"], "target-available-form");
    let target = name(&event["target"]);
    assert_eq!(event["target"]["title"], "Example");

    let reply = client.request(json!({
        "to": watcher,
        "type": "watchResources",
        "resourceTypes": ["document-event"],
    }));
    assert_eq!(reply, json!({"from": watcher}));

    client.notify(1, DebuggeeEvent::NavigationStart {
        url: "https://example.com/next".to_owned(),
    });
    assert_eq!(
        client.next(),
        json!({
            "from": target,
            "type": "tabNavigated",
            "url": "https://example.com/next",
            "title": "Example",
            "state": "start",
        })
    );
    let event = client.next();
    assert_eq!(event["type"], "resources-available-array");
    assert_eq!(event["array"][0][0], "document-event");
    assert_eq!(event["array"][0][1][0]["name"], "will-navigate");
    assert_eq!(event["array"][0][1][0]["newURI"], "https://example.com/next");

    client.notify(1, DebuggeeEvent::NavigationStop {
        url: "https://example.com/next".to_owned(),
        title: "Next".to_owned(),
        process_swap: false,
    });
    let event = client.next();
    assert_eq!(event["type"], "tabNavigated");
    assert_eq!(event["state"], "stop");
    assert_eq!(event["title"], "Next");
    let event = client.next();
    assert_eq!(event["array"][0][1][0]["name"], "dom-complete");

    // Events for other tabs are ignored, and unwatching is not answered.
    client.notify(2, DebuggeeEvent::TitleChanged {
        title: "Elsewhere".to_owned(),
    });
    client.send(json!({"to": watcher, "type": "unwatchResources", "resourceTypes": ["document-event"]}));
    let reply = client.request(json!({"to": "root", "type": "listTabs"}));
    assert_eq!(reply["from"], "root");
    client.notify(1, DebuggeeEvent::NavigationStart {
        url: "https://example.com/again".to_owned(),
    });
    assert_eq!(client.next()["type"], "tabNavigated");
    let reply = client.request(json!({"to": "root", "type": "listTabs"}));
    assert_eq!(reply["from"], "root");
}

#[test]
fn parent_browsing_context() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);
    let reply = client.request(json!({"to": descriptor, "type": "getWatcher"}));
    let watcher = name(&reply["watcher"]);

    let reply = client.request(json!({
        "to": watcher,
        "type": "getParentBrowsingContextID",
        "browsingContextID": 15,
    }));
    assert_eq!(reply, json!({"from": watcher, "browsingContextID": 10}));

    let reply = client.request(json!({
        "to": watcher,
        "type": "getParentBrowsingContextID",
        "browsingContextID": 10,
    }));
    assert_eq!(reply, json!({"from": watcher, "browsingContextID": null}));
}

#[test]
fn navigate_to_waits_for_the_load() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);

    client.send(json!({
        "to": descriptor,
        "type": "navigateTo",
        "url": "https://example.com/slow",
        "waitForLoad": true,
    }));
    // Queued behind the navigation.
    client.send(json!({"to": descriptor, "type": "getFavicon"}));

    // Other actors are still served.
    let reply = client.request(json!({"to": "root", "type": "listTabs"}));
    assert_eq!(reply["from"], "root");
    assert!(
        client
            .debuggee
            .calls()
            .contains(&"navigate 1 https://example.com/slow".to_owned())
    );

    client.notify(1, DebuggeeEvent::NavigationStop {
        url: "https://example.com/slow".to_owned(),
        title: "Slow".to_owned(),
        process_swap: false,
    });
    assert_eq!(client.next(), json!({"from": descriptor}));
    assert_eq!(client.next()["favicon"], "data:image/png;base64,1");
}

#[test]
fn navigate_to_without_waiting() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);
    let reply = client.request(json!({"to": descriptor, "type": "navigateTo", "url": "about:blank"}));
    assert_eq!(reply, json!({"from": descriptor}));

    let reply = client.request(json!({"to": descriptor, "type": "navigateTo"}));
    assert_eq!(reply["error"], "missingParameter");
}

#[test]
fn process_swap_replaces_the_target() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);
    let reply = client.request(json!({"to": descriptor, "type": "getWatcher"}));
    let watcher = name(&reply["watcher"]);
    client.request(json!({"to": watcher, "type": "watchTargets", "targetType": "frame"}));
    let old_target = name(&client.next()["target"]);

    client.notify(1, DebuggeeEvent::NavigationStop {
        url: "https://other.example/".to_owned(),
        title: "Other".to_owned(),
        process_swap: true,
    });
    let event = client.next();
    assert_eq!(event["type"], "target-destroyed-form");
    assert_eq!(name(&event["target"]), old_target);
    let event = client.next();
    assert_eq!(event["type"], "target-available-form");
    let new_target = name(&event["target"]);
    assert_ne!(new_target, old_target);
    assert_eq!(client.debuggee.count("attach"), 2);

    let reply = client.request(json!({"to": old_target, "type": "reload"}));
    assert_eq!(reply["error"], "noSuchActor");
    let reply = client.request(json!({"to": new_target, "type": "reload"}));
    assert_eq!(reply, json!({"from": new_target}));
}

#[test]
fn crash_drops_the_target_and_the_pending_navigation() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(2);
    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    let target = name(&reply["frame"]);

    client.send(json!({
        "to": descriptor,
        "type": "navigateTo",
        "url": "https://servo.org/crash",
        "waitForLoad": true,
    }));
    // Make sure the navigation is in flight before the crash.
    client.request(json!({"to": "root", "type": "listTabs"}));
    client.notify(2, DebuggeeEvent::ProcessCrashed);

    let reply = client.next();
    assert_eq!(reply["from"], descriptor.as_str());
    assert_eq!(reply["error"], "wrongState");

    let reply = client.request(json!({"to": target, "type": "reload"}));
    assert_eq!(reply["error"], "noSuchActor");

    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    assert_ne!(name(&reply["frame"]), target);
    assert_eq!(client.debuggee.count("attach"), 2);
}

#[test]
fn closed_tabs_are_announced() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);
    client.notify(1, DebuggeeEvent::TabClosed);

    let events: BTreeSet<(String, String)> = (0..2)
        .map(|_| {
            let event = client.next();
            (
                event["from"].as_str().unwrap().to_owned(),
                event["type"].as_str().unwrap().to_owned(),
            )
        })
        .collect();
    let expected: BTreeSet<(String, String)> = [
        (descriptor.clone(), "descriptor-destroyed".to_owned()),
        ("root".to_owned(), "tabListChanged".to_owned()),
    ]
    .into_iter()
    .collect();
    assert_eq!(events, expected);

    let reply = client.request(json!({"to": descriptor, "type": "getFavicon"}));
    assert_eq!(reply["error"], "noSuchActor");
}

#[test]
fn detach_releases_the_descriptor_and_its_target() {
    let mut client = TestClient::connect();
    let descriptor = client.descriptor(1);
    let reply = client.request(json!({"to": descriptor, "type": "getTarget"}));
    let target = name(&reply["frame"]);

    let reply = client.request(json!({"to": descriptor, "type": "detach"}));
    assert_eq!(reply, json!({"from": descriptor}));
    assert_eq!(client.debuggee.count("detach 1"), 1);

    for to in [&descriptor, &target] {
        let reply = client.request(json!({"to": to, "type": "reload"}));
        assert_eq!(reply["from"], to.as_str());
        assert_eq!(reply["error"], "noSuchActor");
    }

    assert_ne!(client.descriptor(1), descriptor);
}

#[test]
fn protocol_description_lists_every_actor() {
    let mut client = TestClient::connect();
    let reply = client.request(json!({"to": "root", "type": "protocolDescription"}));
    let types = reply["types"].as_object().unwrap();
    let names: Vec<&str> = types.keys().map(String::as_str).collect();
    assert_eq!(names, ["root", "tabDescriptor", "watcher", "windowGlobalTarget"]);

    let descriptor = &types["tabDescriptor"];
    assert_eq!(descriptor["typeName"], "tabDescriptor");
    let methods: Vec<&str> = descriptor["methods"]
        .as_array()
        .unwrap()
        .iter()
        .map(|method| method["name"].as_str().unwrap())
        .collect();
    assert!(methods.contains(&"navigateTo"));
    assert!(descriptor["events"]["descriptor-destroyed"].is_object());
}

#[test]
fn closing_the_handle_ends_the_connection() {
    let mut client = TestClient::connect();
    client.handle.close();
    assert!(client.transport.source.recv_packet().unwrap().is_none());
    client.handle.join();
}

#[test]
fn server_speaks_over_tcp() {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = ServerOptions {
        port: 0,
        ..ServerOptions::default()
    };
    let (control, port) = start_server(options, MockDebuggee::new()).unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let greeting = read_json_packet(&mut reader, 1 << 20).unwrap().unwrap();
    assert_eq!(greeting["from"], "root");

    stream
        .write_json_packet(&json!({"to": "root", "type": "listTabs"}))
        .unwrap();
    let reply = read_json_packet(&mut reader, 1 << 20).unwrap().unwrap();
    assert_eq!(reply["tabs"].as_array().unwrap().len(), 2);

    control.send(ServerControlMsg::Exit).unwrap();
}
