use crate::config::Config;
use crate::demux::DemuxSettings;
use crate::error::{CoreResult, TagStreamError};

/// What a run needs once its model has been resolved.
#[derive(Debug, Clone)]
pub struct Handler {
    pub provider: String,
    pub settings: DemuxSettings,
}

type HandlerFactory = Box<dyn Fn() -> Handler + Send + Sync>;

struct Entry {
    /// Lowercased model-id substring.
    pattern: String,
    factory: HandlerFactory,
}

/// Maps model ids to handlers.
///
/// Predicates are case-insensitive substrings. Among matching predicates
/// the longest wins and equal lengths go to the earliest registered, so
/// `deepseek-r1` beats `deepseek` whatever the registration order.
pub struct HandlerTable {
    entries: Vec<Entry>,
    default: HandlerFactory,
}

impl HandlerTable {
    pub fn new<F>(default: F) -> Self
    where
        F: Fn() -> Handler + Send + Sync + 'static,
    {
        Self {
            entries: Vec::new(),
            default: Box::new(default),
        }
    }

    pub fn register<F>(&mut self, pattern: &str, factory: F) -> CoreResult<()>
    where
        F: Fn() -> Handler + Send + Sync + 'static,
    {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err(TagStreamError::Validation(
                "routing pattern must not be empty".into(),
            ));
        }
        self.entries.push(Entry {
            pattern,
            factory: Box::new(factory),
        });
        Ok(())
    }

    /// Build from `routing`: one entry per rule, rule-level
    /// `stream_reasoning` overriding the stream default.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let base = DemuxSettings::from_config(cfg)?;
        let default = Handler {
            provider: cfg.routing.default.clone(),
            settings: base.clone(),
        };
        let mut table = Self::new(move || default.clone());
        for rule in &cfg.routing.rules {
            let mut settings = base.clone();
            if let Some(flag) = rule.stream_reasoning {
                settings.stream_reasoning = flag;
            }
            let handler = Handler {
                provider: rule.provider.clone(),
                settings,
            };
            table.register(&rule.pattern, move || handler.clone())?;
        }
        Ok(table)
    }

    /// The winning pattern for `model`, if any rule matches.
    pub fn matched_pattern(&self, model: &str) -> Option<&str> {
        self.best(model).map(|e| e.pattern.as_str())
    }

    pub fn resolve(&self, model: &str) -> Handler {
        match self.best(model) {
            Some(e) => (e.factory)(),
            None => {
                tracing::debug!(model, "no routing rule matched; using default handler");
                (self.default)()
            }
        }
    }

    fn best(&self, model: &str) -> Option<&Entry> {
        let model = model.to_lowercase();
        let mut best: Option<&Entry> = None;
        for e in self.entries.iter().filter(|e| model.contains(&e.pattern)) {
            // strict `>` keeps the earliest on ties
            if best.is_none_or(|b| e.pattern.len() > b.pattern.len()) {
                best = Some(e);
            }
        }
        best
    }
}
