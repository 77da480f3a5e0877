/// Store is a transactional resource from which exactly one transaction
/// handle is obtained, and later released.
///
/// Both methods are only ever called from the drain thread of a TxnContext,
/// which owns the Store for its lifetime. The Store itself must be Send so that
/// it can be moved onto that thread, but its transaction handle need not be:
/// it's created, used, and dropped on the drain thread alone.
pub trait Store: Send + 'static {
    type Txn: 'static;

    /// Begin the transaction which all subsequent operations will share.
    fn begin(&mut self) -> anyhow::Result<Self::Txn>;

    /// Release a transaction handle previously returned by `begin`.
    fn release(&mut self, txn: Self::Txn) -> anyhow::Result<()>;
}
