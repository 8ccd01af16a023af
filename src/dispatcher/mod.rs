// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Command dispatcher.
//!
//! Every remote operation is a [`Command`]: it validates its arguments,
//! declares whether it may be retried, and maps the response body to a typed
//! result. [`Dispatcher::execute`] turns a command into transport calls under
//! one deadline and applies the uniform error mapping:
//!
//! - transport failures and transient service codes are retried with
//!   exponential backoff, for idempotent commands only;
//! - `NoSuchTransaction` on a transactional call becomes
//!   [`Error::TransactionExpired`];
//! - lock conflicts become [`Error::TransactionConflict`];
//! - an expired deadline becomes [`Error::Timeout`].

pub mod commands;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ClientConfig;
use crate::error::{Error, ErrorCode, ServiceError, TransportErrorKind};
use crate::path::YPath;
use crate::txn::TransactionId;
use crate::transport::{Params, Request, Response, ResponseStatus, Transport};

use commands::{GetTabletState, MountState};

/// A typed remote operation.
pub trait Command {
    type Output;

    /// Wire name of the command.
    const NAME: &'static str;

    /// Returns true if repeating the command has the same effect as running it once.
    fn is_idempotent(&self) -> bool;

    /// Checks arguments before anything is sent.
    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn params(&self) -> Params;

    fn body(&self) -> Option<serde_json::Value> {
        None
    }

    /// Transaction the command runs in, if any.
    fn transaction_id(&self) -> Option<&TransactionId> {
        None
    }

    /// Asks for a streamed reply where the backend supports it.
    fn wants_stream(&self) -> bool {
        false
    }

    /// Codes that mean the command lost a conflict with another transaction.
    fn conflict_codes(&self) -> &'static [ErrorCode] {
        &[ErrorCode::TRANSACTION_LOCK_CONFLICT]
    }

    fn parse_response(&self, response: Response) -> Result<Self::Output, Error>;
}

/// Executes commands over a transport.
#[derive(Debug)]
pub struct Dispatcher {
    transport: Transport,
    config: ClientConfig,
}

impl Dispatcher {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            transport: Transport::new(&config),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Runs a command to completion within `request_timeout`.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output, Error> {
        self.execute_by(command, Instant::now() + self.config.request_timeout)
            .await
    }

    /// Runs a command to completion before `deadline`, retries included.
    pub async fn execute_by<C: Command>(&self, command: &C, deadline: Instant) -> Result<C::Output, Error> {
        command.validate()?;

        let timeout = deadline.saturating_duration_since(Instant::now());
        let policy = &self.config.retry_policy;
        let mut attempt = 0u32;

        loop {
            let request = Request {
                command: C::NAME,
                params: command.params(),
                body: command.body(),
                transaction_id: command.transaction_id().cloned(),
                deadline,
                streaming: command.wants_stream() && self.transport.supports_streaming(),
            };

            let error = match self.transport.send(request).await {
                Ok(mut response) => {
                    match std::mem::replace(&mut response.status, ResponseStatus::Ok) {
                        ResponseStatus::Ok => return command.parse_response(response),
                        ResponseStatus::Failed(err) => map_service_error(command, err),
                    }
                }
                Err(err) if err.kind == TransportErrorKind::Timeout => {
                    debug!(command = C::NAME, error = %err, "deadline expired");
                    return Err(Error::Timeout(timeout));
                }
                Err(err) => Error::Transport(err),
            };

            attempt += 1;
            if !command.is_idempotent() || !error.is_retriable() || attempt >= policy.max_attempts {
                return Err(error);
            }
            let delay = policy.delay(attempt - 1);
            if Instant::now() + delay >= deadline {
                return Err(error);
            }
            warn!(command = C::NAME, attempt, ?delay, error = %error, "retrying command");
            tokio::time::sleep(delay).await;
        }
    }

    /// Polls the table's tablet state until it equals `target`.
    ///
    /// Polls every `tablet_state_poll_interval` and gives up with
    /// [`Error::Timeout`] after `mount_wait_timeout`. A poll never runs past
    /// that deadline, even when `request_timeout` is longer.
    pub async fn wait_for_tablet_state(&self, path: &YPath, target: MountState) -> Result<(), Error> {
        let wait = self.config.mount_wait_timeout;
        let interval = self.config.tablet_state_poll_interval;
        let deadline = Instant::now() + wait;
        let query = GetTabletState { path: path.clone() };

        loop {
            let poll_deadline = deadline.min(Instant::now() + self.config.request_timeout);
            let state = match self.execute_by(&query, poll_deadline).await {
                Ok(state) => state,
                Err(Error::Timeout(_)) if poll_deadline == deadline => {
                    return Err(Error::Timeout(wait))
                }
                Err(err) => return Err(err),
            };
            if state == target {
                info!(path = %path, state = %state, "tablet state reached");
                return Ok(());
            }
            debug!(path = %path, state = %state, target = %target, "waiting for tablet state");
            if Instant::now() + interval >= deadline {
                return Err(Error::Timeout(wait));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Classifies a service rejection of `command`.
fn map_service_error<C: Command>(command: &C, err: ServiceError) -> Error {
    let Some(id) = command.transaction_id() else {
        return Error::Service(err);
    };
    if err.find_matching(ErrorCode::NO_SUCH_TRANSACTION).is_some() {
        return Error::TransactionExpired { id: id.clone() };
    }
    if command
        .conflict_codes()
        .iter()
        .any(|code| err.find_matching(*code).is_some())
    {
        return Error::TransactionConflict {
            id: id.clone(),
            error: err,
        };
    }
    Error::Service(err)
}
