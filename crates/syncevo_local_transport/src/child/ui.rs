//! Password requests of the nested session, answered by the parent.

use std::cell::RefCell;
use std::rc::Rc;

use syncevo_protocol::{Call, PasswordRequest, ReplyValue, SyncStatus};
use syncevo_runtime::{EventLoop, SuspendController};
use tracing::debug;

use crate::error::{LocalTransportError, RpcError, TransportResult};
use crate::rpc::WeakRpcConnection;
use crate::session::PasswordSource;

/// Asks the parent's UI for passwords.
pub struct ChildUi {
    connection: WeakRpcConnection,
    event_loop: EventLoop,
    suspend: SuspendController,
}

impl ChildUi {
    pub(crate) fn new(
        connection: WeakRpcConnection,
        event_loop: EventLoop,
        suspend: SuspendController,
    ) -> Self {
        Self {
            connection,
            event_loop,
            suspend,
        }
    }
}

impl PasswordSource for ChildUi {
    fn ask_password(&self, request: &PasswordRequest) -> TransportResult<String> {
        let connection = self
            .connection
            .upgrade()
            .ok_or(LocalTransportError::Rpc(RpcError::ConnectionLost))?;
        debug!(name = %request.name, description = %request.description, "requesting password from parent");
        let answer = Rc::new(RefCell::new(None));
        let slot = answer.clone();
        connection.call(Call::AskPassword(request.clone()), move |result| {
            *slot.borrow_mut() = Some(result);
        })?;

        let result = loop {
            if let Some(result) = answer.borrow_mut().take() {
                break result;
            }
            if !self.suspend.is_normal() {
                return Err(LocalTransportError::status_error(
                    SyncStatus::USER_ABORT,
                    format!("User did not provide the '{}' password.", request.name),
                ));
            }
            self.event_loop.iterate();
        };

        match result {
            Ok(ReplyValue::Password(password)) => Ok(password),
            Ok(_) => Err(RpcError::UnexpectedReply {
                method: "AskPassword",
            }
            .into()),
            Err(RpcError::Remote(err)) => match err.status {
                Some(status) => Err(LocalTransportError::status_error(status, err.message)),
                None => Err(LocalTransportError::status_error(
                    SyncStatus::FATAL,
                    format!("retrieving password failed: {}", err.message),
                )),
            },
            Err(err) => Err(LocalTransportError::status_error(
                err.status(),
                format!("retrieving password failed: {err}"),
            )),
        }
    }
}
