//! Remote step execution.
//!
//! The transport offers no native way to set a working directory or
//! environment for a remote command, so every staged step file gets a
//! generated shell preamble prepended: a change-directory directive, one
//! export per secret, then one export per environment variable in
//! lexicographic key order.

use std::borrow::Cow;

use shell_escape::unix::escape;
use tokio_util::sync::CancellationToken;

use crate::provider::{Instance, Provisioner};
use crate::spec::{OsFamily, ResourceSpec, State, StepSpec};
use crate::transport::{
    CommandSession, DialTarget, FileTransfer, OutputSink, RemoteClient, Signal, Transport,
    TransportError,
};

use super::{Engine, EngineError};

impl<P, T> Engine<P, T>
where
    P: Provisioner + 'static,
    T: Transport + 'static,
{
    /// Runs one pipeline step on the instance bound to `spec`, streaming its
    /// combined output into `output`.
    ///
    /// The instance is dialled without retry: setup already proved it
    /// responsive. Completion is raced against `cancel`; on cancellation one
    /// best-effort kill signal is sent to the remote process (many remote
    /// shells do not honour it) and [`EngineError::Cancelled`] is returned
    /// with no state.
    ///
    /// A nonzero exit is not an error: a structured exit status lands in
    /// [`State::exit_code`], any other command failure maps to 255, and the
    /// call still returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for connectivity or staging failures, and
    /// [`EngineError::Cancelled`] when cancellation wins the race.
    pub async fn run(
        &self,
        spec: &ResourceSpec,
        step: &StepSpec,
        output: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<State, EngineError<P::Error>> {
        let instance = spec.instance.as_ref().ok_or(EngineError::NotBound)?;
        let target = dial_target(spec, instance);
        let client = self
            .inner
            .transport
            .dial(&target)
            .await
            .map_err(|source| EngineError::connectivity(instance.ip.clone(), source))?;

        self.stage_step_files(spec, step, instance, &client).await?;

        let session = client.open_session().await.map_err(|source| {
            tracing::error!(ip = %instance.ip, error = %source, "failed to open session");
            EngineError::connectivity(instance.ip.clone(), source)
        })?;

        let command = command_line(step);
        tracing::debug!(id = %instance.id, command = %command, "remote session started");

        tokio::select! {
            result = session.run(&command, output) => {
                let state = exit_state(result);
                tracing::debug!(exit_code = state.exit_code, "remote session finished");
                Ok(state)
            }
            () = cancel.cancelled() => {
                // Best effort: not every remote shell delivers signals.
                if let Err(err) = session.signal(Signal::Kill).await {
                    tracing::debug!(error = %err, "failed to kill remote process");
                }
                tracing::debug!(id = %instance.id, "remote session cancelled");
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Uploads every step file with its generated preamble prepended.
    async fn stage_step_files(
        &self,
        spec: &ResourceSpec,
        step: &StepSpec,
        instance: &Instance,
        client: &T::Client,
    ) -> Result<(), EngineError<P::Error>> {
        if step.files.is_empty() {
            return Ok(());
        }
        let files = client.open_files().await.map_err(|source| {
            tracing::error!(ip = %instance.ip, error = %source, "failed to open file channel");
            EngineError::connectivity(instance.ip.clone(), source)
        })?;
        for entry in &step.files {
            let composed = compose_step_file(spec.os, step, &entry.data);
            files
                .upload(&entry.path, &composed, entry.mode)
                .await
                .map_err(|source| EngineError::staging(entry.path.clone(), source))?;
        }
        Ok(())
    }
}

/// Builds the dial target for the instance bound to a spec.
pub(super) fn dial_target(spec: &ResourceSpec, instance: &Instance) -> DialTarget {
    DialTarget::new(&instance.ip, &spec.user, &spec.private_key)
}

/// Maps the session outcome to an exit state. The transport cannot observe
/// the out-of-memory killer, so `oom_killed` is always false.
fn exit_state(result: Result<(), TransportError>) -> State {
    let exit_code = match result {
        Ok(()) => 0,
        Err(TransportError::ExitStatus(code)) => code,
        Err(err) => {
            tracing::debug!(error = %err, "remote command failed without an exit status");
            255
        }
    };
    State {
        exit_code,
        exited: true,
        oom_killed: false,
    }
}

/// Joins the step command and its arguments with spaces.
fn command_line(step: &StepSpec) -> String {
    if step.args.is_empty() {
        return step.command.clone();
    }
    format!("{} {}", step.command, step.args.join(" "))
}

/// Prepends the generated preamble to a step file's content.
fn compose_step_file(os: OsFamily, step: &StepSpec, data: &[u8]) -> Vec<u8> {
    let mut script = String::new();
    script.push_str(&format!("cd {}\n", step.working_dir));
    for secret in &step.secrets {
        script.push_str(&export_directive(os, &secret.env, secret.value.reveal()));
    }
    for (key, value) in &step.envs {
        script.push_str(&export_directive(os, key, value));
    }
    let mut composed = script.into_bytes();
    composed.extend_from_slice(data);
    composed
}

/// Renders one export directive in the target OS's shell syntax.
fn export_directive(os: OsFamily, key: &str, value: &str) -> String {
    match os {
        OsFamily::Windows => format!("$Env:{key} = {value:?}\n"),
        OsFamily::Linux => format!("export {key}={}\n", escape(Cow::from(value))),
    }
}
