//! Action-type to backend-handler dispatch table.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use omni_protocol::{
    Action, ActionKind, ActionType, FileEdit, Observation, ObservationKind, ReadFile, WriteFile,
};
use omni_sandbox::{SandboxBackend, SandboxError, SandboxResult, edit_lines};

use crate::RuntimeError;

pub type HandlerFuture<'a> = BoxFuture<'a, SandboxResult<Observation>>;

/// A handler receives the backend, the action and the effective timeout.
pub type ActionHandler =
    for<'a> fn(&'a dyn SandboxBackend, &'a Action, Duration) -> HandlerFuture<'a>;

/// Every backend must handle these.
pub const REQUIRED_ACTIONS: [ActionType; 3] =
    [ActionType::Run, ActionType::Read, ActionType::Write];

/// Resolved once per runtime so that dispatch is a map lookup, and a backend
/// missing a mandatory handler is rejected before any action arrives.
pub struct HandlerTable {
    handlers: BTreeMap<ActionType, ActionHandler>,
}

impl HandlerTable {
    pub fn for_backend(backend: &dyn SandboxBackend) -> Result<Self, RuntimeError> {
        for action in REQUIRED_ACTIONS {
            if !backend.supports(action) {
                return Err(RuntimeError::MissingHandler {
                    action,
                    backend: backend.kind(),
                });
            }
        }

        let mut handlers: BTreeMap<ActionType, ActionHandler> = BTreeMap::new();
        handlers.insert(ActionType::Run, run);
        handlers.insert(ActionType::Read, read);
        handlers.insert(ActionType::Write, write);
        // Edit falls back to read-modify-write when there is no native handler.
        if backend.supports(ActionType::Edit) {
            handlers.insert(ActionType::Edit, edit_native);
        } else {
            handlers.insert(ActionType::Edit, edit_via_read_write);
        }
        if backend.supports(ActionType::RunIpython) {
            handlers.insert(ActionType::RunIpython, run_code_cell);
        }
        if backend.supports(ActionType::Browse) {
            handlers.insert(ActionType::Browse, browse);
        }
        if backend.supports(ActionType::BrowseInteractive) {
            handlers.insert(ActionType::BrowseInteractive, browse_interactive);
        }
        Ok(Self { handlers })
    }

    pub fn get(&self, action: ActionType) -> Option<ActionHandler> {
        self.handlers.get(&action).copied()
    }

    pub fn action_types(&self) -> impl Iterator<Item = ActionType> + '_ {
        self.handlers.keys().copied()
    }
}

fn mismatch(action: &Action) -> SandboxError {
    SandboxError::Failed(format!("handler dispatched with a {} action", action.action_type()))
}

fn run<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::RunCommand(run) => backend.run(run, timeout).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn run_code_cell<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::RunCodeCell(cell) => backend.run_code_cell(cell, timeout).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn read<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    _timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::ReadFile(read) => backend.read(read).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn write<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    _timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::WriteFile(write) => backend.write(write).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn edit_native<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    _timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::EditFile(edit) => backend.edit(edit).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn edit_via_read_write<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    _timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let ActionKind::EditFile(edit) = &action.kind else {
            return Err(mismatch(action));
        };
        let previous = match backend.read(&ReadFile::whole(edit.path.clone())).await {
            Ok(observation) => match observation.kind {
                ObservationKind::Error(_) => return Ok(observation),
                _ => Some(observation.content),
            },
            Err(SandboxError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let updated = match &previous {
            Some(existing) => edit_lines(existing, edit.start, edit.end, &edit.content),
            None => edit.content.clone(),
        };
        let written = backend.write(&WriteFile::whole(edit.path.clone(), updated.clone())).await?;
        if written.is_error() {
            return Ok(written);
        }
        Ok(Observation::new(
            format!("The file {} was edited.", edit.path),
            ObservationKind::FileEdit(FileEdit {
                path: edit.path.clone(),
                prev_exist: previous.is_some(),
                old_content: previous,
                new_content: Some(updated),
            }),
        ))
    })
}

fn browse<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::BrowseUrl(browse) => backend.browse(browse, timeout).await,
            _ => Err(mismatch(action)),
        }
    })
}

fn browse_interactive<'a>(
    backend: &'a dyn SandboxBackend,
    action: &'a Action,
    timeout: Duration,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        match &action.kind {
            ActionKind::BrowseInteractive(browse) => {
                backend.browse_interactive(browse, timeout).await
            }
            _ => Err(mismatch(action)),
        }
    })
}
