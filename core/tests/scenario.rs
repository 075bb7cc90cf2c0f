//! End-to-end relationship loading against the in-memory store.

use std::time::Duration;

use lazyjoin_core::{
    Count, DeferError, Deferred, DeferredList, Fetch, Identify, RelationField, RelationListField,
    Resolvable, Scope, Source, lazy,
};
use lazyjoin_store::{Filter, MemoryStore};

#[derive(Debug, Clone, PartialEq)]
struct User {
    id: u32,
}

impl Identify for User {
    type Key = u32;

    fn identify(&self) -> Option<u32> {
        Some(self.id)
    }
}

/// Article that stores raw keys and loads relationships into separate slots.
#[derive(Debug, Clone)]
struct KeyedArticle {
    id: u32,
    created_by_key: u32,
    editors_keys: Vec<u32>,
    created_by: Option<Deferred<User>>,
    editors: Option<DeferredList<User>>,
    same_author_count: Option<Deferred<u64>>,
}

impl Identify for KeyedArticle {
    type Key = u32;

    fn identify(&self) -> Option<u32> {
        Some(self.id)
    }
}

/// Article whose relationship fields hold deferred values directly.
#[derive(Debug, Clone)]
struct Article {
    id: u32,
    created_by: RelationField<User>,
    editors: RelationListField<User>,
    same_author_count: Option<Deferred<u64>>,
}

impl Identify for Article {
    type Key = u32;

    fn identify(&self) -> Option<u32> {
        Some(self.id)
    }
}

const U1: User = User { id: 1 };
const U2: User = User { id: 2 };

fn users(latency: Duration) -> MemoryStore<User> {
    let store = MemoryStore::with_latency(latency);
    store.put(U1).unwrap();
    store.put(U2).unwrap();
    store
}

fn keyed_articles(latency: Duration) -> MemoryStore<KeyedArticle> {
    let store = MemoryStore::with_latency(latency);
    for (id, author, editors) in [(10, 1, vec![1]), (20, 2, vec![2, 1])] {
        store
            .put(KeyedArticle {
                id,
                created_by_key: author,
                editors_keys: editors,
                created_by: None,
                editors: None,
                same_author_count: None,
            })
            .unwrap();
    }
    store
}

fn articles(users: &Source<User>, latency: Duration) -> MemoryStore<Article> {
    let store = MemoryStore::with_latency(latency);
    for (id, author, editors) in [(10, 1, vec![1]), (20, 2, vec![2, 1])] {
        store
            .put(Article {
                id,
                created_by: RelationField::with_key(users.clone(), author),
                editors: RelationListField::with_keys(users.clone(), editors),
                same_author_count: None,
            })
            .unwrap();
    }
    store
}

fn same_author(author: u32) -> Filter<Article> {
    Filter::new(move |article: &Article| {
        article
            .created_by
            .stored_key()
            .is_ok_and(|key| key == author)
    })
}

async fn assert_loaded(mut loaded: Vec<Article>) {
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].id, 10);
    assert_eq!(loaded[1].id, 20);

    let expected = [(U1, vec![U1]), (U2, vec![U2, U1])];
    for (article, (author, editors)) in loaded.iter_mut().zip(expected) {
        let created_by = article.created_by.deferred_mut().unwrap();
        assert_eq!(created_by.require_key().unwrap(), &author.id);
        assert_eq!(created_by.value().await.unwrap(), &author);

        let list = article.editors.list_mut().unwrap();
        let keys: Vec<u32> = editors.iter().map(|u| u.id).collect();
        assert_eq!(list.keys().unwrap(), Some(keys.as_slice()));
        let values: Vec<Option<User>> = editors.into_iter().map(Some).collect();
        assert_eq!(list.values().await.unwrap(), values.as_slice());

        let count = article.same_author_count.as_mut().unwrap();
        assert_eq!(count.value().await.unwrap(), &1);
    }
}

#[tokio::test]
async fn loads_relationships_from_key_fields() {
    let users = users(Duration::ZERO);
    let articles = keyed_articles(Duration::ZERO);

    let select_related = lazy({
        let users = users.clone();
        let articles = articles.clone();
        move |scope: Scope, mut loaded: Vec<KeyedArticle>| {
            let users = users.clone();
            let articles = articles.clone();
            async move {
                for article in &mut loaded {
                    article.created_by = Some(scope.defer(users.fetch_one(&article.created_by_key))?);
                    article.editors =
                        Some(scope.defer_list(users.fetch_many(&article.editors_keys))?);
                    let author = article.created_by_key;
                    let count = articles.count_matching(&Filter::new(
                        move |other: &KeyedArticle| other.created_by_key == author,
                    ));
                    article.same_author_count = Some(scope.defer(count)?);
                }
                Ok::<_, DeferError>(loaded)
            }
        }
    });

    let mut loaded = select_related(articles.all()).await.unwrap();

    assert_eq!(loaded.len(), 2);
    let calls = users.calls();
    assert_eq!(calls.fetch_one, 2);
    assert_eq!(calls.fetch_many, 2);

    let expected = [(U1, vec![Some(U1)]), (U2, vec![Some(U2), Some(U1)])];
    for (article, (author, editors)) in loaded.iter_mut().zip(expected) {
        let created_by = article.created_by.as_mut().unwrap();
        assert_eq!(created_by.try_value().unwrap(), Some(&author));
        assert_eq!(created_by.require_key().unwrap(), &author.id);

        let list = article.editors.as_mut().unwrap();
        assert_eq!(list.try_values().unwrap(), Some(editors.as_slice()));

        let count = article.same_author_count.as_mut().unwrap();
        assert_eq!(count.try_value().unwrap(), Some(&1));
    }
}

fn select_related(
    articles: MemoryStore<Article>,
) -> impl Fn(Vec<Article>) -> lazyjoin_core::LazyTask<Vec<Article>, DeferError> {
    lazy(move |scope: Scope, mut loaded: Vec<Article>| {
        let articles = articles.clone();
        async move {
            for article in &mut loaded {
                article.created_by.defer_in(&scope)?;
                article.editors.defer_in(&scope)?;
                let author = article.created_by.stored_key()?;
                let count = articles.count_matching(&same_author(author));
                article.same_author_count = Some(scope.defer(count)?);
            }
            Ok::<_, DeferError>(loaded)
        }
    })
}

#[tokio::test]
async fn loads_relationships_from_deferred_fields() {
    let users = users(Duration::ZERO);
    let articles = articles(&users.source(), Duration::ZERO);

    let loaded = select_related(articles.clone())(articles.all()).await.unwrap();

    let calls = users.calls();
    assert_eq!(calls.fetch_one, 2);
    assert_eq!(calls.fetch_many, 2);
    assert_eq!(articles.calls().count, 2);
    assert_loaded(loaded).await;
}

#[tokio::test(start_paused = true)]
async fn requests_across_iterations_overlap() {
    let latency = Duration::from_millis(100);
    let users = users(latency);
    let articles = articles(&users.source(), latency);

    let started = tokio::time::Instant::now();
    let task = select_related(articles.clone())(articles.all());
    let loaded = task.await.unwrap();
    let elapsed = started.elapsed();

    // Six requests at 100ms each; sequential loading would take 600ms.
    assert!(elapsed >= latency);
    assert!(elapsed < latency * 2, "took {elapsed:?}");

    // Everything is already resolved, so reading values does not wait again.
    let before = tokio::time::Instant::now();
    assert_loaded(loaded).await;
    assert_eq!(before.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn missing_author_fails_the_combined_wait() {
    let users = users(Duration::ZERO);
    let source = users.source();
    let articles = MemoryStore::new();
    articles
        .put(Article {
            id: 30,
            created_by: RelationField::with_key(source.clone(), 99),
            editors: RelationListField::with_keys(source, vec![1, 99]),
            same_author_count: None,
        })
        .unwrap();

    let err = select_related(articles.clone())(articles.all())
        .await
        .unwrap_err();
    assert!(matches!(err, DeferError::Fetch(lazyjoin_core::FetchError::NotFound { .. })));
}

#[tokio::test]
async fn mixed_editor_list_is_rejected_before_fetching() {
    let users = users(Duration::ZERO);
    let mut editors = RelationListField::new(users.source());

    let err = editors
        .assign_items(vec![Resolvable::Key(1), Resolvable::Value(U2)])
        .unwrap_err();

    assert!(matches!(err, DeferError::TypeMismatch { .. }));
    assert_eq!(users.calls().fetch_one, 0);
    assert_eq!(users.calls().fetch_many, 0);
}
