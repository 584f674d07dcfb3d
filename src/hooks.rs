//! Synchronous in-process event bus.
//!
//! External plugins register callbacks against a fixed event vocabulary and
//! may observe, mutate, or halt the step that dispatched the event. Callbacks
//! run inline on the dispatching task and must not block.

use parking_lot::RwLock;

use crate::config::UpstreamConfig;

/// `irc.connection.pre`: dispatched just before an upstream dial. A callback
/// may rewrite the upstream descriptor or halt to refuse the connection.
pub struct IrcConnectionPre {
    pub session_id: u64,
    pub upstream: UpstreamConfig,
    pub halt: bool,
}

/// `irc.line`: dispatched for every line in either direction before it is
/// forwarded. Halting drops the line.
pub struct IrcLine {
    pub session_id: u64,
    pub line: String,
    pub to_server: bool,
    pub halt: bool,
}

/// `client.state`: dispatched after a session connects upstream or ends.
pub struct ClientState {
    pub session_id: u64,
    pub connected: bool,
}

/// `client.ready`: dispatched when upstream registration completes (001).
pub struct ClientReady {
    pub session_id: u64,
}

/// `status.client`: dispatched per session while rendering the status page;
/// callbacks may append extra lines.
pub struct StatusClient {
    pub session_id: u64,
    pub extra_lines: Vec<String>,
}

/// `gateway.closing`: dispatched when the gateway is told to shut down.
pub struct GatewayClosing {
    pub halt: bool,
}

/// `new.client.error`: dispatched when a transport's client was refused
/// before a session could be created.
pub struct NewClientError {
    pub remote_addr: String,
    pub reason: String,
}

type Callbacks<T> = RwLock<Vec<Box<dyn Fn(&mut T) + Send + Sync>>>;

#[derive(Default)]
pub struct HookRegistry {
    connection_pre: Callbacks<IrcConnectionPre>,
    irc_line: Callbacks<IrcLine>,
    client_state: Callbacks<ClientState>,
    client_ready: Callbacks<ClientReady>,
    status_client: Callbacks<StatusClient>,
    gateway_closing: Callbacks<GatewayClosing>,
    new_client_error: Callbacks<NewClientError>,
}

macro_rules! dispatchers {
    ($(($register:ident, $dispatch:ident, $field:ident, $event:ty)),* $(,)?) => {
        $(
            pub fn $register<F>(&self, callback: F)
            where
                F: Fn(&mut $event) + Send + Sync + 'static,
            {
                self.$field.write().push(Box::new(callback));
            }

            pub fn $dispatch(&self, event: &mut $event) {
                for callback in self.$field.read().iter() {
                    callback(event);
                }
            }
        )*
    };
}

impl HookRegistry {
    pub fn new() -> HookRegistry {
        HookRegistry::default()
    }

    dispatchers!(
        (on_connection_pre, dispatch_connection_pre, connection_pre, IrcConnectionPre),
        (on_irc_line, dispatch_irc_line, irc_line, IrcLine),
        (on_client_state, dispatch_client_state, client_state, ClientState),
        (on_client_ready, dispatch_client_ready, client_ready, ClientReady),
        (on_status_client, dispatch_status_client, status_client, StatusClient),
        (on_gateway_closing, dispatch_gateway_closing, gateway_closing, GatewayClosing),
        (on_new_client_error, dispatch_new_client_error, new_client_error, NewClientError),
    );
}
