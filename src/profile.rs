//! BlueZ RFCOMM profile registration.
//!
//! Registers `/org/mdr` as an `org.bluez.Profile1` implementation of the
//! Sony MDR proprietary RFCOMM service and turns incoming `NewConnection`
//! calls into a stream of [ConnectRequest]s for the daemon to accept or
//! reject.

use std::{os::fd::IntoRawFd, sync::Arc};

use dbus::{
    arg::{OwnedFd as DbusOwnedFd, PropMap, RefArg, Variant},
    nonblock::{Proxy, SyncConnection},
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use tokio::sync::{mpsc, oneshot};

use crate::{
    address::Address,
    bus::method_call,
    error::{Error, ErrorKind},
    io::Connection,
};

/// The MDR proprietary RFCOMM service UUID.
pub const MDR_UUID: &str = "96CC203E-5068-46AD-B32D-E316F5E069BA";

const MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
const MANAGER_PATH: &str = "/org/bluez";
const PROFILE_INTERFACE: &str = "org.bluez.Profile1";

/// Our well-known bus name and the object path we register the profile at
///.
pub const SERVICE_NAME: &str = "org.mdr";
pub const PROFILE_PATH: &str = "/org/mdr";

/// A pending RFCOMM connection offered to us by BlueZ on behalf of `device`.
pub struct ConnectRequest {
    device: Address,
    fd: DbusOwnedFd,
    tx: oneshot::Sender<Result<(), Error>>,
}

impl ConnectRequest {
    /// The device offering this connection.
    pub fn device(&self) -> Address {
        self.device
    }

    /// Accepts the connection, adopting its file descriptor as an async
    /// stream and acknowledging the `NewConnection` call.
    pub fn accept(self) -> Result<Connection, Error> {
        match unsafe { Connection::from_raw_fd(self.fd.into_raw_fd()) } {
            Ok(conn) => {
                let _ = self.tx.send(Ok(()));
                Ok(conn)
            }
            Err(err) => {
                let err =
                    Error::with_message(ErrorKind::Internal(crate::error::InternalErrorKind::Io(err.kind())), "");
                let _ = self.tx.send(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Rejects the connection, failing the `NewConnection` call with `err`.
    pub fn reject(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

/// An event delivered from a BlueZ profile callback to the daemon loop.
pub(crate) enum ProfileEvent {
    /// `NewConnection`: BlueZ is offering a connection to accept or reject.
    Connect(ConnectRequest),
    /// `RequestDisconnection`: tear down the named device's session.
    Disconnect(Address),
    /// `Release`: BlueZ dropped our profile registration; tear down every
    /// session and stop the daemon loop.
    Release,
}

pub(crate) struct RegisteredProfile {
    req_tx: mpsc::Sender<ProfileEvent>,
}

impl RegisteredProfile {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(PROFILE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "NewConnection",
                ("device", "fd", "fd_properties"),
                (),
                |ctx, cr, (device_path, fd, _props): (dbus::Path<'static>, DbusOwnedFd, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let device = Address::from_device_path(&device_path).ok_or_else(|| {
                            log::error!("cannot parse device path: {device_path}");
                            dbus::MethodErr::invalid_arg("device")
                        })?;

                        let (tx, rx) = oneshot::channel();
                        let request = ConnectRequest { device, fd, tx };
                        if reg.req_tx.send(ProfileEvent::Connect(request)).await.is_err() {
                            return Err(dbus::MethodErr::failed("mdrd is shutting down"));
                        }

                        match rx.await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(err)) => Err(err.into()),
                            Err(_) => Err(dbus::MethodErr::failed("connection handler dropped the request")),
                        }
                    })
                },
            );

            ib.method_with_cr_async(
                "RequestDisconnection",
                ("device",),
                (),
                |ctx, cr, (device_path,): (dbus::Path<'static>,)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let device = Address::from_device_path(&device_path).ok_or_else(|| {
                            log::error!("cannot parse device path: {device_path}");
                            dbus::MethodErr::invalid_arg("device")
                        })?;
                        let _ = reg.req_tx.send(ProfileEvent::Disconnect(device)).await;
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    log::info!("bluetoothd released our profile registration");
                    let _ = reg.req_tx.send(ProfileEvent::Release).await;
                    Ok(())
                })
            });
        })
    }
}

/// Handle to the registered profile; drop to unregister.
pub struct ProfileHandle {
    req_rx: mpsc::Receiver<ProfileEvent>,
    _drop_tx: oneshot::Sender<()>,
}

impl ProfileHandle {
    /// Waits for the next profile event: an inbound connection offer, a
    /// disconnection request, or profile release.
    pub(crate) async fn recv(&mut self) -> Option<ProfileEvent> {
        self.req_rx.recv().await
    }
}

/// Registers the MDR profile with BlueZ's profile manager.
pub(crate) async fn register(
    connection: Arc<SyncConnection>, crossroads: &tokio::sync::Mutex<Crossroads>, token: IfaceToken<Arc<RegisteredProfile>>,
) -> Result<ProfileHandle, Error> {
    let (req_tx, req_rx) = mpsc::channel(8);
    let path = dbus::Path::new(PROFILE_PATH).unwrap();

    {
        let mut cr = crossroads.lock().await;
        cr.insert(path.clone(), &[token], Arc::new(RegisteredProfile { req_tx }));
    }

    let mut options = PropMap::new();
    options.insert("Name".to_string(), Variant(Box::new("MDR".to_string()) as Box<dyn RefArg>));
    options.insert("Role".to_string(), Variant(Box::new("client".to_string()) as Box<dyn RefArg>));
    options.insert("AutoConnect".to_string(), Variant(Box::new(true) as Box<dyn RefArg>));

    let proxy = Proxy::new(crate::bus::BLUEZ_SERVICE_NAME, MANAGER_PATH, crate::bus::TIMEOUT, connection.clone());
    proxy.method_call(MANAGER_INTERFACE, "RegisterProfile", (path.clone(), MDR_UUID, options)).await?;

    let (drop_tx, drop_rx) = oneshot::channel();
    let unreg_path = path.clone();
    tokio::spawn(async move {
        let _ = drop_rx.await;
        log::trace!("unregistering profile at {unreg_path}");
        let _: std::result::Result<(), dbus::Error> =
            proxy.method_call(MANAGER_INTERFACE, "UnregisterProfile", (unreg_path,)).await;
    });

    Ok(ProfileHandle { req_rx, _drop_tx: drop_tx })
}
