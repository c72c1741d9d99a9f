//! Runtime filter changes

use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, Registry, layer::Layer, reload};

use crate::error::{LogError, LogResult};

pub(super) type BoxedFilter = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Swaps the installed filter while the logger runs
#[derive(Clone)]
pub struct ReloadHandle {
    inner: reload::Handle<EnvFilter, Registry>,
    directives: Arc<Mutex<String>>,
}

impl ReloadHandle {
    /// Replace the whole filter
    ///
    /// # Errors
    /// `LogError::Filter` if `directives` does not parse; the old filter stays.
    pub fn reload(&self, directives: &str) -> LogResult<()> {
        let mut current = self.directives.lock();
        self.apply(directives)?;
        *current = directives.to_string();
        Ok(())
    }

    /// Set the level of one target and keep every other directive
    ///
    /// `set_target_level("custodian_broker::rotation", "trace")` turns on
    /// swap tracing without touching the rest of the filter.
    pub fn set_target_level(&self, target: &str, level: &str) -> LogResult<()> {
        let mut current = self.directives.lock();
        let merged = with_target_level(&current, target, level);
        self.apply(&merged)?;
        *current = merged;
        Ok(())
    }

    /// Directives currently installed
    pub fn current_filter(&self) -> String {
        self.directives.lock().clone()
    }

    fn apply(&self, directives: &str) -> LogResult<()> {
        self.inner
            .reload(parse(directives)?)
            .map_err(|e| LogError::Reload(e.to_string()))
    }
}

pub(super) fn parse(directives: &str) -> LogResult<EnvFilter> {
    EnvFilter::try_new(directives).map_err(|e| LogError::Filter {
        filter: directives.to_string(),
        reason: e.to_string(),
    })
}

/// Filter layer for `directives`, reloadable on request
pub(super) fn filter_layer(
    directives: &str,
    reloadable: bool,
) -> LogResult<(BoxedFilter, Option<ReloadHandle>)> {
    let filter = parse(directives)?;
    if !reloadable {
        return Ok((Box::new(filter), None));
    }

    let (layer, inner) = reload::Layer::new(filter);
    let handle = ReloadHandle {
        inner,
        directives: Arc::new(Mutex::new(directives.to_string())),
    };
    Ok((Box::new(layer), Some(handle)))
}

fn with_target_level(directives: &str, target: &str, level: &str) -> String {
    let prefix = format!("{target}=");
    let directive = format!("{target}={level}");
    let mut kept: Vec<&str> = directives
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.starts_with(&prefix))
        .collect();
    kept.push(&directive);
    kept.join(",")
}
