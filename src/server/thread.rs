//! Server lifecycle thread: a restart/exit command loop.
//!
//! One OS thread owns the bind/run/teardown cycle, so a configuration change
//! is just a `restart` command from any thread. Commands are monotonic —
//! `Exit` is never downgraded by a later `Restart` — and teardown blocks on
//! the old server's destroyed signal before the next bind, so a connection
//! still attached to the old socket can never race the new one.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use super::core::ServerCore;
use super::engine::{Server, ServerConfig};

/// Builds a fresh transport core for every (re)start.
pub type CoreFactory = Box<dyn Fn() -> std::io::Result<Arc<dyn ServerCore>> + Send>;

/// Invoked on the server thread once a restarted server is bound and serving.
pub type ReadyCallback = Box<dyn Fn() + Send>;

enum Command {
    None,
    Restart(Box<ServerConfig>),
    Exit,
}

impl Command {
    fn rank(&self) -> u8 {
        match self {
            Command::None => 0,
            Command::Restart(_) => 1,
            Command::Exit => 2,
        }
    }
}

struct ThreadShared {
    command: Mutex<Command>,
    signal: Condvar,
    /// Core of the currently running server, so a command can interrupt its
    /// event loop.
    active: Mutex<Option<Arc<dyn ServerCore>>>,
}

/// Owns the server thread; dropping it exits and joins.
pub struct ServerThread {
    shared: Arc<ThreadShared>,
    handle: Option<JoinHandle<()>>,
}

impl ServerThread {
    #[must_use]
    pub fn new(factory: CoreFactory, ready: ReadyCallback) -> Self {
        let shared = Arc::new(ThreadShared {
            command: Mutex::new(Command::None),
            signal: Condvar::new(),
            active: Mutex::new(None),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("server".to_string())
            .spawn(move || thread_main(&thread_shared, &factory, &ready))
            // Thread spawning fails only on resource exhaustion at startup.
            .unwrap_or_else(|e| panic!("failed to spawn server thread: {e}"));
        ServerThread {
            shared,
            handle: Some(handle),
        }
    }

    /// Tear down the current server, if any, and start one with `config`.
    /// Coalesces: a restart not yet picked up is replaced by a newer one.
    pub fn restart(&self, config: ServerConfig) {
        self.send_command(Command::Restart(Box::new(config)));
    }

    /// Stop the current server and end the thread. Irreversible.
    pub fn exit(&self) {
        self.send_command(Command::Exit);
    }

    fn send_command(&self, command: Command) {
        {
            let mut slot = self.shared.command.lock();
            if command.rank() < slot.rank() {
                return;
            }
            *slot = command;
        }
        self.shared.signal.notify_one();
        if let Some(core) = self.shared.active.lock().as_ref() {
            core.exit();
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        self.exit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn thread_main(shared: &Arc<ThreadShared>, factory: &CoreFactory, ready: &ReadyCallback) {
    debug!("server thread started");
    loop {
        let command = {
            let mut slot = shared.command.lock();
            while matches!(*slot, Command::None) {
                shared.signal.wait(&mut slot);
            }
            std::mem::replace(&mut *slot, Command::None)
        };
        match command {
            Command::Exit => break,
            Command::Restart(config) => run_one_server(shared, factory, ready, *config),
            Command::None => {}
        }
    }
    debug!("server thread exiting");
}

fn run_one_server(
    shared: &Arc<ThreadShared>,
    factory: &CoreFactory,
    ready: &ReadyCallback,
    config: ServerConfig,
) {
    let port = config.port;
    let core = match factory() {
        Ok(core) => core,
        Err(err) => {
            error!(error = %err, "failed to create transport core");
            return;
        }
    };
    let (destroyed_tx, destroyed_rx) = bounded::<()>(0);
    let server = match Server::create(Arc::clone(&core), config, destroyed_tx) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, port, "failed to bind server");
            return;
        }
    };
    *shared.active.lock() = Some(Arc::clone(&core));
    // A command issued while the server was still being constructed found
    // `active` empty and could not interrupt anything; deliver it now so the
    // run loop below returns immediately instead of stranding the command.
    if !matches!(*shared.command.lock(), Command::None) {
        core.exit();
    }
    info!(port, "server started");
    ready();
    server.run();
    *shared.active.lock() = None;

    // Dropping the server and its core releases every clone of the
    // destroyed-signal sender still held by in-flight contexts; the recv
    // disconnects only once all of them are gone.
    drop(server);
    drop(core);
    let _ = destroyed_rx.recv();
    info!(port, "server stopped");
}
