use derive_more::Constructor;
use tracing::warn;

/// Transmitter abstraction over different channel kinds.
pub trait Tx
where
    Self: Clone + Send,
{
    type Item;
    type Error;
    fn send(&self, item: Self::Item) -> Result<(), Self::Error>;
}

/// [`Tx`] implementation backed by a `tokio::sync::mpsc::UnboundedSender`.
#[derive(Debug)]
pub struct UnboundedTx<T> {
    pub tx: tokio::sync::mpsc::UnboundedSender<T>,
}

impl<T> UnboundedTx<T> {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<T>) -> Self {
        Self { tx }
    }
}

impl<T> Clone for UnboundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Tx for UnboundedTx<T>
where
    T: Send,
{
    type Item = T;
    type Error = tokio::sync::mpsc::error::SendError<T>;

    fn send(&self, item: Self::Item) -> Result<(), Self::Error> {
        self.tx.send(item)
    }
}

/// Construct an unbounded channel, returning the [`UnboundedTx`] and [`UnboundedRx`] halves.
pub fn mpsc_unbounded<T>() -> (UnboundedTx<T>, UnboundedRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (UnboundedTx::new(tx), UnboundedRx::new(rx))
}

/// Receiver half associated with an [`UnboundedTx`].
#[derive(Debug, Constructor)]
pub struct UnboundedRx<T> {
    pub rx: tokio::sync::mpsc::UnboundedReceiver<T>,
}

impl<T> UnboundedRx<T> {
    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<T> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// [`Tx`] wrapper that disables itself after the first failed send rather than propagating
/// the error.
///
/// Useful for optional downstream consumers (eg/ an external storage sink) whose failure must
/// never interrupt the owning data pipeline.
#[derive(Debug, Clone)]
pub struct TxDroppable<ChannelTx> {
    state: State<ChannelTx>,
}

#[derive(Debug, Clone)]
enum State<Tx> {
    Active(Tx),
    Disabled,
}

impl<ChannelTx> TxDroppable<ChannelTx>
where
    ChannelTx: Tx,
{
    pub fn new(tx: ChannelTx) -> Self {
        Self {
            state: State::Active(tx),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Send an item, disabling the transmitter on failure.
    pub fn send(&mut self, item: ChannelTx::Item) {
        let State::Active(tx) = &self.state else {
            return;
        };

        if tx.send(item).is_err() {
            warn!("TxDroppable receiver dropped - disabling transmitter");
            self.state = State::Disabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_droppable_disables_after_receiver_drop() {
        let (tx, rx) = mpsc_unbounded::<u64>();
        let mut droppable = TxDroppable::new(tx);

        droppable.send(1);
        assert!(droppable.is_active());

        drop(rx);
        droppable.send(2);
        assert!(!droppable.is_active());

        // Further sends are silent no-ops
        droppable.send(3);
        assert!(!droppable.is_active());
    }
}
