use serde::{Deserialize, Serialize};

/// Comando que recibe un worker al hacer poll.
///
/// En el cable va etiquetado por `action`:
/// `{"action":"task","task":"sleep","duration":30}`, `{"action":"stop"}`
/// o `{"action":"none"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Task {
        task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        duration: u64,
    },
    Stop,
    None,
}

impl Command {
    pub fn is_none(&self) -> bool {
        matches!(self, Command::None)
    }
}

/// Lo que el worker necesita saber para ejecutar una tarea localmente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task: String,
    pub resource: Option<String>,
    pub duration_secs: u64,
}

impl TaskSpec {
    /// Convierte un comando en tarea; `None` si no es `Command::Task`.
    pub fn from_command(cmd: &Command) -> Option<Self> {
        match cmd {
            Command::Task {
                task,
                resource,
                duration,
            } => Some(TaskSpec {
                task: task.clone(),
                resource: resource.clone(),
                duration_secs: *duration,
            }),
            _ => None,
        }
    }
}
