//! lazyjoin CLI - loads article relationships through the trampoline.
//!
//! Seeds an in-memory store with users and articles, then loads every article's
//! author, editors and same-author count in one lazy run:
//!
//! ```text
//! main() -> load_config() -> seed() -> select_related(articles) -> report
//!                                           |
//!                                           v
//!                             one combined wait for 3 requests per article
//! ```
//!
//! Configuration lives in `~/.lazyjoin/config.toml` (or `$LAZYJOIN_CONFIG`):
//!
//! ```toml
//! [join]
//! policy = "collect_all"
//!
//! [demo]
//! latency_ms = 50
//! articles = 8
//! ```

use std::{
    env,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use lazyjoin_core::{
    Count, DeferError, Deferred, LazyConfig, LazyTask, RelationField, RelationListField, Scope,
    Source, Trampoline, load_toml,
};
use lazyjoin_store::{Filter, MemoryStore};
use lazyjoin_types::Identify;

const CONFIG_ENV: &str = "LAZYJOIN_CONFIG";
const USERS: u32 = 3;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[derive(Debug, Default, Deserialize)]
struct CliConfig {
    #[serde(flatten)]
    lazy: LazyConfig,
    #[serde(default)]
    demo: DemoConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    /// Simulated round trip for every store request.
    latency_ms: u64,
    articles: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            articles: 4,
        }
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".lazyjoin").join("config.toml"))
}

fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    let Some(path) = path.filter(|path| path.exists()) else {
        return Ok(CliConfig::default());
    };
    let config = load_toml(path)?;
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

#[derive(Debug, Clone, Serialize)]
struct User {
    id: u32,
    name: String,
}

impl Identify for User {
    type Key = u32;

    fn identify(&self) -> Option<u32> {
        Some(self.id)
    }
}

#[derive(Debug, Clone, Serialize)]
struct Article {
    id: u32,
    title: String,
    created_by: RelationField<User>,
    editors: RelationListField<User>,
    #[serde(skip)]
    same_author_count: Option<Deferred<u64>>,
}

impl Identify for Article {
    type Key = u32;

    fn identify(&self) -> Option<u32> {
        Some(self.id)
    }
}

fn seed(config: &DemoConfig) -> Result<(MemoryStore<User>, MemoryStore<Article>)> {
    let latency = Duration::from_millis(config.latency_ms);
    let users = MemoryStore::with_latency(latency);
    for id in 1..=USERS {
        users.put(User {
            id,
            name: format!("user-{id}"),
        })?;
    }

    let source: Source<User> = users.source();
    let articles = MemoryStore::with_latency(latency);
    for id in 1..=config.articles {
        let author = (id - 1) % USERS + 1;
        let editors = (1..=USERS).filter(|u| *u != author).take(2).collect();
        articles.put(Article {
            id,
            title: format!("article-{id}"),
            created_by: RelationField::with_key(source.clone(), author),
            editors: RelationListField::with_keys(source.clone(), editors),
            same_author_count: None,
        })?;
    }
    Ok((users, articles))
}

fn same_author(author: u32) -> Filter<Article> {
    Filter::new(move |article: &Article| {
        article
            .created_by
            .stored_key()
            .is_ok_and(|key| key == author)
    })
}

fn select_related(
    trampoline: Trampoline,
    articles: MemoryStore<Article>,
) -> impl Fn(Vec<Article>) -> LazyTask<Vec<Article>, DeferError> {
    trampoline.wrap(move |scope: Scope, mut loaded: Vec<Article>| {
        let articles = articles.clone();
        async move {
            for article in &mut loaded {
                let author = article.created_by.stored_key()?;
                if !(1..=USERS).contains(&author) {
                    return Err(DeferError::coroutine(format!(
                        "article {} references unknown author {author}",
                        article.id
                    )));
                }
                article.created_by.defer_in(&scope)?;
                article.editors.defer_in(&scope)?;
                let count = articles.count_matching(&same_author(author));
                article.same_author_count = Some(scope.defer(count)?);
            }
            tracing::debug!(pending = scope.pending_len(), "Requests issued");
            Ok::<_, DeferError>(loaded)
        }
    })
}

async fn report(article: &mut Article) -> Result<()> {
    let author = article.created_by.deferred_mut()?.value().await?.name.clone();
    let editors: Vec<String> = article
        .editors
        .list_mut()?
        .values()
        .await?
        .iter()
        .map(|user| user.as_ref().map_or("<missing>", |u| u.name.as_str()).to_string())
        .collect();
    let same_author = match article.same_author_count.as_mut() {
        Some(count) => *count.value().await?,
        None => 0,
    };
    println!(
        "{:<12} author={author:<8} editors=[{}] same_author={same_author}",
        article.title,
        editors.join(", "),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config(config_path().as_deref())?;
    let trampoline = Trampoline::with_config(&config.lazy);
    tracing::info!(
        policy = trampoline.policy().as_str(),
        latency_ms = config.demo.latency_ms,
        articles = config.demo.articles,
        "Starting"
    );

    let (users, articles) = seed(&config.demo)?;

    let started = Instant::now();
    let mut loaded = select_related(trampoline, articles.clone())(articles.all()).await?;
    let elapsed = started.elapsed();

    for article in &mut loaded {
        report(article).await?;
    }

    let requests = users.calls().fetch_one + users.calls().fetch_many + articles.calls().count;
    let sequential = Duration::from_millis(config.demo.latency_ms)
        * u32::try_from(requests).unwrap_or(u32::MAX);
    println!("{requests} requests in {elapsed:?} (sequential estimate {sequential:?})");

    if let Some(first) = loaded.first() {
        println!("stored form: {}", serde_json::to_string(first)?);
    }
    Ok(())
}
