use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot};

use super::{EngineError, EngineFactory, EngineVariant};
use crate::backend_traits::CompilationRequest;

/// Messages understood by an engine worker. Every command gets exactly one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Mkdir { path: String },
    WriteFile { path: String, contents: Vec<u8> },
    SetMainFile { path: String },
    CompileLatex,
    FlushCache,
    Grace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReply {
    pub status: i32,
    pub log: String,
    pub pdf: Option<Vec<u8>>,
}

impl EngineReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failure(log: impl Into<String>) -> Self {
        Self {
            status: -1,
            log: log.into(),
            pdf: None,
        }
    }
}

/// The compute unit. Runs on the worker thread and never sees the caller.
pub trait EngineCore: Send {
    fn compile(&mut self, fs: &VirtualFs, main_file: &str) -> EngineReply;
}

/// Private filesystem of one engine instance.
#[derive(Debug, Default, Clone)]
pub struct VirtualFs {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl VirtualFs {
    pub fn mkdir(&mut self, path: &str) -> Result<(), String> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        if !self.dir_exists(parent(&path)) {
            return Err(format!("mkdir {}: parent directory does not exist", path));
        }
        self.dirs.insert(path);
        Ok(())
    }

    pub fn write(&mut self, path: &str, contents: Vec<u8>) -> Result<(), String> {
        let path = normalize(path);
        if path.is_empty() {
            return Err("writefile: empty path".to_string());
        }
        if !self.dir_exists(parent(&path)) {
            return Err(format!("writefile {}: no such directory", path));
        }
        self.files.insert(path, contents);
        Ok(())
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    pub fn read_to_string(&self, path: &str) -> Option<String> {
        self.read(path).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(&normalize(path))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.dirs.clear();
        self.files.clear();
    }

    fn dir_exists(&self, dir: &str) -> bool {
        dir.is_empty() || self.dirs.contains(dir)
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

struct Envelope {
    command: EngineCommand,
    reply: oneshot::Sender<EngineReply>,
}

/// Handle to one engine thread. Dropping every handle stops the thread.
#[derive(Debug)]
pub(crate) struct EngineWorker {
    variant: EngineVariant,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EngineWorker {
    /// Starts the thread and waits for the load handshake.
    pub(crate) async fn spawn(
        variant: EngineVariant,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name(format!("tex-engine-{}", variant))
            .spawn(move || match factory.load(variant) {
                Ok(core) => {
                    let _ = ready_tx.send(Ok(()));
                    run(variant, core, rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Unavailable(format!("cannot start engine thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { variant, tx }),
            Ok(Err(reason)) => Err(EngineError::Failed(format!(
                "{} engine failed to load: {}",
                variant, reason
            ))),
            Err(_) => Err(EngineError::Failed(format!("{} engine exited while loading", variant))),
        }
    }

    pub(crate) async fn post(&self, command: EngineCommand) -> Result<EngineReply, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope { command, reply })
            .map_err(|_| EngineError::Disconnected(self.variant))?;
        response.await.map_err(|_| EngineError::Disconnected(self.variant))
    }

    /// Replaces the whole virtual filesystem with the job's files, then compiles.
    pub(crate) async fn run_job(
        &self,
        request: &CompilationRequest,
    ) -> Result<EngineReply, EngineError> {
        accepted(self.post(EngineCommand::FlushCache).await?)?;

        let files = request.files();
        let dirs: BTreeSet<String> = files
            .iter()
            .flat_map(|f| ancestors(&normalize(&f.path)))
            .collect();
        for path in dirs {
            accepted(self.post(EngineCommand::Mkdir { path }).await?)?;
        }

        for file in files {
            let contents = file.bytes().map_err(|e| EngineError::Job(e.to_string()))?;
            accepted(self.post(EngineCommand::WriteFile { path: file.path, contents }).await?)?;
        }

        let main_file = request.main_file().to_string();
        let selected = self.post(EngineCommand::SetMainFile { path: main_file.clone() }).await?;
        if selected.status != 0 {
            // a missing main file is a document error
            return Ok(EngineReply {
                status: 1,
                log: format!("! LaTeX Error: File `{}' not found.\n", main_file),
                pdf: None,
            });
        }
        self.post(EngineCommand::CompileLatex).await
    }

    /// Asks the thread to stop after whatever it is doing now.
    pub(crate) fn terminate(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.tx.send(Envelope { command: EngineCommand::Grace, reply });
    }
}

fn accepted(reply: EngineReply) -> Result<(), EngineError> {
    if reply.status == 0 {
        Ok(())
    } else {
        Err(EngineError::Job(reply.log))
    }
}

/// `a/b/c.tex` -> `["a", "a/b"]`
fn ancestors(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').collect();
    (1..parts.len()).map(|n| parts[..n].join("/")).collect()
}

fn run(
    variant: EngineVariant,
    mut core: Box<dyn EngineCore>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut fs = VirtualFs::default();
    let mut main_file: Option<String> = None;

    while let Some(Envelope { command, reply }) = rx.blocking_recv() {
        let response = match command {
            EngineCommand::Mkdir { path } => {
                fs.mkdir(&path).map_or_else(EngineReply::failure, |()| EngineReply::ok())
            }
            EngineCommand::WriteFile { path, contents } => {
                fs.write(&path, contents).map_or_else(EngineReply::failure, |()| EngineReply::ok())
            }
            EngineCommand::SetMainFile { path } => {
                if fs.exists(&path) {
                    main_file = Some(normalize(&path));
                    EngineReply::ok()
                } else {
                    EngineReply::failure(format!("setmainfile {}: no such file", path))
                }
            }
            EngineCommand::CompileLatex => match &main_file {
                Some(main) => match catch_unwind(AssertUnwindSafe(|| core.compile(&fs, main))) {
                    Ok(reply) => reply,
                    Err(_) => {
                        log::error!("{} engine panicked while compiling {}", variant, main);
                        // dropping the reply tells the manager the instance is gone
                        break;
                    }
                },
                None => EngineReply::failure("compilelatex: no main file set"),
            },
            EngineCommand::FlushCache => {
                fs.clear();
                main_file = None;
                EngineReply::ok()
            }
            EngineCommand::Grace => {
                let _ = reply.send(EngineReply::ok());
                break;
            }
        };
        let _ = reply.send(response);
    }

    log::debug!("{} engine thread stopped", variant);
}
