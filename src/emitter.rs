//! Frames `next`, `error`, and `complete` messages for one operation,
//! giving the application hooks a chance to replace each payload.

use serde_json::Value;

use crate::{
    client_message::SubscribePayload,
    context::ConnectionContext,
    error::Error,
    executor::ExecutionResult,
    server_message::ServerMessage,
    socket::Socket,
    Hooks,
};

pub(crate) struct Emitter<'a> {
    socket: &'a Socket,
    hooks: &'a dyn Hooks,
    ctx: &'a ConnectionContext,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(socket: &'a Socket, hooks: &'a dyn Hooks, ctx: &'a ConnectionContext) -> Self {
        Self { socket, hooks, ctx }
    }

    /// Sends a `next` message. Whatever the hook returns replaces the
    /// payload; otherwise the result is shaped as `{data, errors?}`.
    pub(crate) async fn next(&self, id: &str, result: ExecutionResult) -> Result<(), Error> {
        let replaced = self
            .hooks
            .on_next(self.ctx, id, &result)
            .await
            .map_err(Error::Hook)?;
        let payload = replaced.unwrap_or_else(|| result.into_payload());
        self.socket
            .send(&ServerMessage::Next {
                id: id.into(),
                payload,
            })
            .await
    }

    /// Sends an `error` message. Whatever the hook returns replaces the
    /// payload; otherwise the errors are sent as given.
    pub(crate) async fn error(&self, id: &str, errors: Vec<Value>) -> Result<(), Error> {
        let replaced = self
            .hooks
            .on_error(self.ctx, id, &errors)
            .await
            .map_err(Error::Hook)?;
        let payload = replaced.unwrap_or(Value::Array(errors));
        self.socket
            .send(&ServerMessage::Error {
                id: id.into(),
                payload,
            })
            .await
    }

    /// Runs the completion hook, and only then, when asked to, notifies the
    /// client that the operation is done.
    pub(crate) async fn complete(
        &self,
        notify_client: bool,
        id: &str,
        payload: Option<&SubscribePayload>,
    ) -> Result<(), Error> {
        self.hooks
            .on_complete(self.ctx, id, payload)
            .await
            .map_err(Error::Hook)?;
        if notify_client {
            self.socket
                .send(&ServerMessage::Complete { id: id.into() })
                .await?;
        }
        Ok(())
    }
}
