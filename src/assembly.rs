//! Assembly and compartment lifecycle.
//!
//! A compartment is one ether plus the dispatchers draining it; the
//! assembly owns every compartment and the storage behind every ether. The
//! assembly creates each ether's backing region (a config-resolved shared
//! mapping or a private buffer), wires compartments, and fans
//! `start`/`stop` out in installation order. Stop also runs on drop.

use crate::config::{ConfigError, Context};
use crate::dispatcher::{DispatcherError, Runnable};
use crate::ether::{Ether, EtherError};
use crate::message::MessageSet;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("shared-memory path '{path}' for ether '{ether}' already used by '{used_by}'")]
    BackingPathConflict {
        path: String,
        ether: String,
        used_by: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ether(#[from] EtherError),

    #[error("dispatcher '{name}': {source}")]
    Dispatcher {
        name: String,
        source: DispatcherError,
    },
}

/// Where an ether's slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// File-backed mapping; the path and reset flag come from
    /// configuration, keyed by the message set's type name.
    Shared,
    /// Zeroed private buffer, reset on every construction.
    Private,
}

/// Shortened type name of a message set, as used for configuration keys.
pub fn set_name<L: MessageSet>() -> &'static str {
    let full = std::any::type_name::<L>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Type-keyed directory of the assembly's ethers.
///
/// Lookups happen on component startup paths, not per message, so a lock
/// is fine here.
#[derive(Clone, Default)]
pub struct EtherRegistry {
    inner: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl EtherRegistry {
    pub fn register<L: MessageSet>(&self, ether: Arc<Ether<L>>) {
        self.inner
            .lock()
            .expect("ether registry poisoned")
            .insert(TypeId::of::<L>(), Box::new(ether));
    }

    pub fn get<L: MessageSet>(&self) -> Option<Arc<Ether<L>>> {
        self.inner
            .lock()
            .expect("ether registry poisoned")
            .get(&TypeId::of::<L>())
            .and_then(|any| any.downcast_ref::<Arc<Ether<L>>>())
            .cloned()
    }
}

/// Cloneable view of an assembly handed to dispatchers: the ether
/// directory plus the application context.
#[derive(Clone)]
pub struct AssemblyHandle {
    registry: EtherRegistry,
    context: Arc<Context>,
}

impl AssemblyHandle {
    /// A handle not backed by any assembly: empty directory, default
    /// context. For dispatchers wired by hand (tests, single-loop tools).
    pub fn detached() -> Self {
        Self {
            registry: EtherRegistry::default(),
            context: Arc::new(Context::default()),
        }
    }

    pub fn ether<L: MessageSet>(&self) -> Option<Arc<Ether<L>>> {
        self.registry.get::<L>()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// One ether and the dispatchers that drain it.
pub struct Compartment<L: MessageSet> {
    name: String,
    ether: Arc<Ether<L>>,
    dispatchers: Vec<Box<dyn Runnable>>,
}

impl<L: MessageSet> Compartment<L> {
    pub fn new(name: &str, ether: Arc<Ether<L>>) -> Self {
        Self {
            name: name.to_string(),
            ether,
            dispatchers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ether(&self) -> &Arc<Ether<L>> {
        &self.ether
    }

    /// Adds a dispatcher. Dispatchers start in insertion order and stop in
    /// the same order.
    pub fn add(&mut self, dispatcher: impl Runnable + 'static) {
        self.dispatchers.push(Box::new(dispatcher));
    }
}

/// Control surface the assembly drives compartments through.
trait CompartmentControl: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), AssemblyError>;
    fn stop(&mut self) -> Result<(), AssemblyError>;
}

impl<L: MessageSet> CompartmentControl for Compartment<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), AssemblyError> {
        for dispatcher in &mut self.dispatchers {
            dispatcher
                .start()
                .map_err(|source| AssemblyError::Dispatcher {
                    name: dispatcher.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AssemblyError> {
        let mut first_error = None;
        for dispatcher in &mut self.dispatchers {
            if let Err(source) = dispatcher.stop() {
                log::error!("dispatcher '{}' stopped with: {}", dispatcher.name(), source);
                first_error.get_or_insert(AssemblyError::Dispatcher {
                    name: dispatcher.name().to_string(),
                    source,
                });
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Top-level owner of ethers, their storage, and compartments.
pub struct Assembly {
    context: Arc<Context>,
    registry: EtherRegistry,
    /// Backing path → ether name, for duplicate detection.
    paths: HashMap<String, String>,
    compartments: Vec<Box<dyn CompartmentControl>>,
}

impl Assembly {
    pub fn new(context: Context) -> Self {
        Self {
            context: Arc::new(context),
            registry: EtherRegistry::default(),
            paths: HashMap::new(),
            compartments: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn handle(&self) -> AssemblyHandle {
        AssemblyHandle {
            registry: self.registry.clone(),
            context: self.context.clone(),
        }
    }

    /// Creates an ether, allocates its backing storage, and registers it
    /// for [`AssemblyHandle::ether`] lookups.
    ///
    /// Shared storage resolves the backing path and reset flag from
    /// configuration under the message set's type name; two ethers
    /// configured onto the same path are rejected.
    pub fn create_ether<L: MessageSet>(
        &mut self,
        capacity: usize,
        storage: Storage,
    ) -> Result<Arc<Ether<L>>, AssemblyError> {
        let name = set_name::<L>();
        let ether = match storage {
            Storage::Shared => {
                let path = self.context.config.ether_path(name)?.to_string();
                if let Some(used_by) = self.paths.get(&path) {
                    return Err(AssemblyError::BackingPathConflict {
                        path,
                        ether: name.to_string(),
                        used_by: used_by.clone(),
                    });
                }
                let reset = self.context.config.ether_reset(name);
                log::info!(
                    "ether '{}': shared at '{}' (reset={}, capacity={})",
                    name,
                    path,
                    reset,
                    Ether::<L>::effective_capacity(capacity)
                );
                let ether = Ether::<L>::shared(&path, capacity, reset)?;
                self.paths.insert(path, name.to_string());
                ether
            }
            Storage::Private => {
                log::info!(
                    "ether '{}': private (capacity={})",
                    name,
                    Ether::<L>::effective_capacity(capacity)
                );
                Ether::<L>::private(capacity)?
            }
        };
        self.registry.register(ether.clone());
        Ok(ether)
    }

    /// Installs a wired compartment. Compartments start in installation
    /// order.
    pub fn install<L: MessageSet>(&mut self, compartment: Compartment<L>) {
        self.compartments.push(Box::new(compartment));
    }

    /// Starts every compartment in order. On failure, compartments
    /// started so far are stopped again before the error is returned.
    pub fn start(&mut self) -> Result<(), AssemblyError> {
        for i in 0..self.compartments.len() {
            if let Err(err) = self.compartments[i].start() {
                log::error!(
                    "assembly start failed in compartment '{}': {}",
                    self.compartments[i].name(),
                    err
                );
                for started in self.compartments[..=i].iter_mut().rev() {
                    let _ = started.stop();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stops every compartment. Returns the first dispatcher error
    /// encountered, after all compartments have been told to stop.
    pub fn stop(&mut self) -> Result<(), AssemblyError> {
        let mut first_error = None;
        for compartment in &mut self.compartments {
            if let Err(err) = compartment.stop() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Assembly {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
