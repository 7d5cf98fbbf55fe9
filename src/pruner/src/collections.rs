//! Naming of the collections that surround a transaction collection.

/// Collection holding the queues of documents removed while transactions
/// still referenced them.
pub fn stash_collection_name(txns: &str) -> String {
    format!("{txns}.stash")
}

/// Collection recording one entry per completed pruning run.
pub fn prune_collection_name(txns: &str) -> String {
    format!("{txns}.prune")
}

/// Filter a database's collection names down to the ones that can hold
/// documents touched by transactions of `txns`.
///
/// Drops the transaction collection and its `<txns>.*` children, system
/// collections and status history. The stash is the one child kept since
/// it holds queues too.
pub fn txn_collections(names: impl IntoIterator<Item = String>, txns: &str) -> Vec<String> {
    let stash = stash_collection_name(txns);
    let children = format!("{txns}.");
    let mut collections: Vec<String> = names
        .into_iter()
        .filter(|name| {
            if *name == stash {
                return true;
            }
            name != txns
                && !name.starts_with(&children)
                && name != "statuseshistory"
                && !name.starts_with("system.")
        })
        .collect();
    collections.sort();
    collections.dedup();
    collections
}
