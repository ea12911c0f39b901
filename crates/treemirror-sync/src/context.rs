use crate::normalize::{ItemFilter, NoopFilter};
use treemirror_core::config::Config;
use treemirror_core::ports::{Authorizer, EntityResolver, MirrorStore, TreeStore};
use treemirror_core::signals::{SignalBackend, SignalStore};

static NOOP_FILTER: NoopFilter = NoopFilter;

/// Collaborators one request works against.
pub struct SyncContext<'a> {
    pub tree: &'a dyn TreeStore,
    pub entities: &'a dyn EntityResolver,
    pub mirror: &'a dyn MirrorStore,
    pub signals: SignalStore<'a>,
    pub authorizer: &'a dyn Authorizer,
    pub config: &'a Config,
    pub filter: &'a dyn ItemFilter,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        tree: &'a dyn TreeStore,
        entities: &'a dyn EntityResolver,
        mirror: &'a dyn MirrorStore,
        signals: &'a dyn SignalBackend,
        authorizer: &'a dyn Authorizer,
        config: &'a Config,
    ) -> Self {
        Self {
            tree,
            entities,
            mirror,
            signals: SignalStore::new(signals, config.signals.clone()),
            authorizer,
            config,
            filter: &NOOP_FILTER,
        }
    }

    pub fn with_filter(mut self, filter: &'a dyn ItemFilter) -> Self {
        self.filter = filter;
        self
    }
}
