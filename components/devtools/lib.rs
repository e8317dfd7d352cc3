/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! An actor-based remote debugging server. Speaks the Firefox
//! [remote debugging protocol](https://firefox-source-docs.mozilla.org/devtools/backend/protocol.html)
//! and exposes the tabs of a [`Debuggee`] through the root, tab descriptor,
//! watcher and window global target actors.

#![crate_name = "rdp_server"]
#![crate_type = "rlib"]
#![deny(unsafe_code)]

use std::io;
use std::mem;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, info, trace, warn};
use rdp_protocol::transport::tcp_transport;
use rdp_protocol::{PacketSink, PacketSource};

use crate::actors::root::RootActor;
use crate::connection::Connection;
pub use crate::connection::ConnectionHandle;
pub use crate::debuggee::{Debuggee, DebuggeeError, DebuggeeEvent, TabInfo, TargetInfo};
pub use crate::options::{DEFAULT_MAX_PACKET_LENGTH, OptionsError, ServerOptions};

mod actor;
/// <https://searchfox.org/mozilla-central/source/devtools/server/actors>
mod actors {
    pub mod root;
    pub mod tab_descriptor;
    pub mod watcher;
    pub mod window_global;
}
mod connection;
mod debuggee;
mod options;

/// Messages to instruct the server to update its known connections according
/// to changes in the embedder.
#[derive(Debug)]
pub enum ServerControlMsg {
    AddClient(TcpStream),
    /// Something happened to the tab with the given browser ID.
    Debuggee(u32, DebuggeeEvent),
    Exit,
}

/// Spin up a server that listens for connections as configured by `options`.
/// Returns the control channel and the port actually bound.
pub fn start_server(
    options: ServerOptions,
    debuggee: Arc<dyn Debuggee>,
) -> io::Result<(Sender<ServerControlMsg>, u16)> {
    let listener = TcpListener::bind((options.bind_address.as_str(), options.port))?;
    let port = listener.local_addr()?.port();
    info!("RDP server listening on {}:{}", options.bind_address, port);

    let (sender, receiver) = unbounded();
    {
        let sender = sender.clone();
        thread::Builder::new()
            .name("RdpCliAcceptor".to_owned())
            .spawn(move || {
                // accept connections and process them, spawning a new thread for each one
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            if sender.send(ServerControlMsg::AddClient(stream)).is_err() {
                                break;
                            }
                        },
                        Err(error) => warn!("Can't retrieve stream: {}", error),
                    }
                }
            })?;
    }

    let instance = ServerInstance {
        receiver,
        options,
        debuggee,
        connections: vec![],
    };
    thread::Builder::new()
        .name("RdpServer".to_owned())
        .spawn(move || instance.run())?;

    Ok((sender, port))
}

/// Run a single connection over an already established transport. The root
/// actor greets the client as soon as the connection starts.
pub fn open_connection(
    sink: Box<dyn PacketSink>,
    source: Box<dyn PacketSource>,
    debuggee: Arc<dyn Debuggee>,
    options: &ServerOptions,
) -> ConnectionHandle {
    let mut connection = Connection::new(sink);
    let root = RootActor::new(options.application_type.clone(), debuggee);
    let greeting = match root.greeting() {
        Ok(greeting) => greeting,
        Err(error) => {
            error!("Unable to build the greeting packet: {}", error);
            Default::default()
        },
    };
    connection.registry_mut().register(Box::new(root));
    connection.spawn(source, greeting)
}

struct ServerInstance {
    receiver: Receiver<ServerControlMsg>,
    options: ServerOptions,
    debuggee: Arc<dyn Debuggee>,
    connections: Vec<ConnectionHandle>,
}

impl ServerInstance {
    fn run(mut self) {
        while let Ok(msg) = self.receiver.recv() {
            trace!("{:?}", msg);
            match msg {
                ServerControlMsg::AddClient(stream) => self.add_client(stream),
                ServerControlMsg::Debuggee(browser_id, event) => {
                    prune_connections(&mut self.connections);
                    for connection in &self.connections {
                        connection.notify(browser_id, event.clone());
                    }
                },
                ServerControlMsg::Exit => break,
            }
        }

        // Shut down all active connections
        for connection in self.connections.drain(..) {
            connection.close();
            connection.join();
        }
        info!("RDP server stopped");
    }

    fn add_client(&mut self, stream: TcpStream) {
        prune_connections(&mut self.connections);
        match stream.peer_addr() {
            Ok(peer) => info!("Connection established to {}", peer),
            Err(error) => warn!("Connection from unknown peer: {}", error),
        }
        match tcp_transport(stream, self.options.max_packet_length) {
            Ok((sink, source)) => {
                let connection = open_connection(
                    Box::new(sink),
                    Box::new(source),
                    self.debuggee.clone(),
                    &self.options,
                );
                self.connections.push(connection);
            },
            Err(error) => warn!("Unable to set up connection: {}", error),
        }
    }
}

/// Drop the connections that went away on their own.
fn prune_connections(connections: &mut Vec<ConnectionHandle>) {
    let (finished, running): (Vec<_>, Vec<_>) = mem::take(connections)
        .into_iter()
        .partition(ConnectionHandle::is_finished);
    *connections = running;
    for connection in finished {
        connection.join();
    }
}
