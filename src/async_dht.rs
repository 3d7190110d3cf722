//! AsyncDht node.

use std::net::SocketAddr;
use std::thread;

use bytes::Bytes;

use crate::{
    common::{Contact, Id},
    dht::Dht,
    error::RequestError,
    rpc::{FoundValue, Info, MaintenanceTask, PutError, RpcError, StoreReport},
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
///
/// Every call runs the blocking operation on its own thread and awaits
/// its result, so it works with any executor.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        self.0.id()
    }

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        self.spawn(|dht| dht.info()).await
    }

    /// Turn this node's routing table to a list of bootstraping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>, DhtWasShutdown> {
        self.spawn(|dht| dht.to_bootstrap()).await
    }

    /// Returns the blocking version of this node.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    /// Shutdown the node.
    pub async fn shutdown(&self) {
        self.0.shutdown()
    }

    /// Store a value at the closest nodes to its key, returns the key.
    pub async fn set<T: Into<Bytes>>(&self, value: T) -> Result<Id, DhtPutError> {
        Ok(self.put(value).await?.key)
    }

    /// Like [AsyncDht::set] but returns which nodes acknowledged the value.
    pub async fn put<T: Into<Bytes>>(&self, value: T) -> Result<StoreReport, DhtPutError> {
        let value = value.into();

        Ok(self.spawn(move |dht| dht.put(value)).await??)
    }

    /// Get the value stored under `key`, `None` if no node has it.
    pub async fn get(&self, key: Id) -> Result<Option<Bytes>, DhtGetError> {
        Ok(self.find_value(key).await?.map(|found| found.value))
    }

    /// Like [AsyncDht::get] but also returns where the value was found.
    pub async fn find_value(&self, key: Id) -> Result<Option<FoundValue>, DhtGetError> {
        Ok(self.spawn(move |dht| dht.find_value(&key)).await??)
    }

    pub async fn find_node(&self, target: Id) -> Result<Vec<Contact>, DhtGetError> {
        Ok(self.spawn(move |dht| dht.find_node(&target)).await??)
    }

    /// Ping a node, returns its [Id].
    pub async fn ping(&self, address: SocketAddr) -> Result<Result<Id, RpcError>, DhtWasShutdown> {
        self.spawn(move |dht| dht.ping(address)).await
    }

    /// Run a maintenance task now.
    pub async fn run_maintenance(&self, task: MaintenanceTask) -> Result<(), DhtWasShutdown> {
        self.spawn(move |dht| dht.run_maintenance(task)).await
    }

    pub fn cancel_maintenance(&self, task: MaintenanceTask) -> bool {
        self.0.cancel_maintenance(task)
    }

    // === Private Methods ===

    async fn spawn<T, F>(&self, operation: F) -> Result<T, DhtWasShutdown>
    where
        T: Send + 'static,
        F: FnOnce(Dht) -> T + Send + 'static,
    {
        if self.0.is_shutdown() {
            return Err(DhtWasShutdown);
        }

        let (sender, receiver) = flume::bounded::<T>(1);
        let dht = self.0.clone();

        thread::Builder::new()
            .name("kademlia-async".to_string())
            .spawn(move || {
                let _ = sender.send(operation(dht));
            })
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The Dht node was shut down before or during the call.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// [AsyncDht::put] errors.
pub enum DhtPutError {
    #[error(transparent)]
    PutError(#[from] PutError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// [AsyncDht::get] and [AsyncDht::find_node] errors.
pub enum DhtGetError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),
}
