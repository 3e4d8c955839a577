//! Top-level wiring: owns the bus connection, the registered profile, and
//! the process-wide device table, and drives the accept loop.

use std::{collections::HashMap, sync::Arc};

use crate::{
    address::Address,
    bus::Bus,
    error::{Error, ErrorKind},
    profile::ProfileEvent,
    session,
};

/// Runs the daemon until the profile registration is dropped or the process
/// is signalled to stop.
pub async fn run() -> Result<(), Error> {
    let (bus, mut profile) = Bus::connect().await?;
    let bus = Arc::new(bus);

    log::info!("mdrd ready, registered MDR profile at /org/mdr");

    let mut devices: HashMap<Address, session::Handle> = HashMap::new();

    while let Some(event) = profile.recv().await {
        match event {
            ProfileEvent::Connect(request) => {
                let address = request.device();

                if let Some(existing) = devices.get(&address) {
                    if !existing.task.is_finished() {
                        log::warn!("{address}: rejecting connection, a session is already active");
                        request.reject(Error::new(ErrorKind::ConnectionRejected));
                        continue;
                    }
                }

                let connection = match request.accept() {
                    Ok(connection) => connection,
                    Err(err) => {
                        log::warn!("{address}: failed to adopt connection: {err}");
                        continue;
                    }
                };

                devices.insert(address, session::spawn(address, connection, bus.clone()));
                devices.retain(|_, handle| {
                    !handle.task.is_finished() || handle.state.borrow().clone() != crate::session::State::Closed
                });
            }
            ProfileEvent::Disconnect(address) => {
                if let Some(handle) = devices.remove(&address) {
                    log::info!("{address}: tearing down session on RequestDisconnection");
                    handle.task.abort();
                } else {
                    log::debug!("{address}: RequestDisconnection for a session we don't have");
                }
            }
            ProfileEvent::Release => {
                log::info!("profile released, tearing down every session and exiting");
                for (_, handle) in devices.drain() {
                    handle.task.abort();
                }
                break;
            }
        }
    }

    log::info!("profile manager channel closed, shutting down");
    Ok(())
}
