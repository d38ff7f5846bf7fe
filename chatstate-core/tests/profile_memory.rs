use chatstate_core::{
    InMemoryProfileStore, Namespace, NamespaceQuery, ProfileItem, ProfileStore, ProfileValue,
    SearchQuery, StoreError, ValueFilter,
};
use futures::TryStreamExt;
use serde_json::{json, Value};

fn profile(value: Value) -> ProfileValue {
    match value {
        Value::Object(map) => map,
        other => panic!("profile literal must be an object, got {other}"),
    }
}

async fn search(
    store: &InMemoryProfileStore,
    prefix: &Namespace,
    query: SearchQuery,
) -> Vec<ProfileItem> {
    store
        .search(prefix, query)
        .try_collect()
        .await
        .expect("search should stream")
}

#[tokio::test]
async fn missing_profile_is_none() {
    let store = InMemoryProfileStore::new();
    let found = store
        .get(&Namespace::from(["users"]), "nobody@example.com")
        .await
        .expect("lookup should succeed");
    assert!(found.is_none());
}

#[tokio::test]
async fn put_replaces_the_whole_value() {
    let store = InMemoryProfileStore::new();
    let users = Namespace::from(["users"]);

    let created = store
        .put(&users, "tom", profile(json!({"facts": ["likes rust"], "name": "Tom"})))
        .await
        .expect("put");
    let replaced = store
        .put(&users, "tom", profile(json!({"preferences": ["short answers"]})))
        .await
        .expect("put");

    let stored = store.get(&users, "tom").await.expect("get").expect("exists");
    assert_eq!(stored.value, profile(json!({"preferences": ["short answers"]})));
    assert!(!stored.value.contains_key("facts"));
    assert_eq!(stored.created_at, created.created_at);
    assert_eq!(stored.updated_at, replaced.updated_at);
    assert!(stored.updated_at >= stored.created_at);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let store = InMemoryProfileStore::new();
    let users = Namespace::from(["users"]);
    store
        .put(&users, "tom", profile(json!({"name": "Tom"})))
        .await
        .expect("put");

    store.delete(&users, "tom").await.expect("delete");
    store.delete(&users, "tom").await.expect("second delete");

    assert!(store.get(&users, "tom").await.expect("get").is_none());
}

#[tokio::test]
async fn search_is_isolated_by_namespace_prefix() {
    let store = InMemoryProfileStore::new().with_page_size(1);
    let users = Namespace::from(["users"]);
    let admins = Namespace::from(["users", "admin"]);
    let lookalike = Namespace::from(["users2"]);
    let facts = Namespace::from(["facts"]);

    store.put(&users, "tom", profile(json!({"name": "Tom"}))).await.expect("put");
    store.put(&users, "ann", profile(json!({"name": "Ann"}))).await.expect("put");
    store.put(&admins, "root", profile(json!({"name": "Root"}))).await.expect("put");
    store.put(&lookalike, "eve", profile(json!({"name": "Eve"}))).await.expect("put");
    store.put(&facts, "users", profile(json!({"name": "nope"}))).await.expect("put");

    let under_users = search(&store, &users, SearchQuery::new()).await;
    let mut keys: Vec<&str> = under_users.iter().map(|item| item.key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["ann", "root", "tom"]);

    let admins_only = search(&store, &admins, SearchQuery::new()).await;
    assert_eq!(admins_only.len(), 1);
    assert_eq!(admins_only[0].namespace, admins);

    let everything = search(&store, &Namespace::root(), SearchQuery::new()).await;
    assert_eq!(everything.len(), 5);
}

#[tokio::test]
async fn slash_in_key_does_not_leak_into_nested_namespace() {
    let store = InMemoryProfileStore::new();
    let users = Namespace::from(["users"]);
    let admins = Namespace::from(["users", "admin"]);

    store
        .put(&users, "admin/x", profile(json!({"kind": "key with slash"})))
        .await
        .expect("put");
    store
        .put(&admins, "x", profile(json!({"kind": "nested"})))
        .await
        .expect("put");

    let flat = store.get(&users, "admin/x").await.expect("get").expect("exists");
    let nested = store.get(&admins, "x").await.expect("get").expect("exists");
    assert_eq!(flat.value["kind"], json!("key with slash"));
    assert_eq!(nested.value["kind"], json!("nested"));

    let under_admin = search(&store, &admins, SearchQuery::new()).await;
    assert_eq!(under_admin.len(), 1);
    assert_eq!(under_admin[0].key, "x");
}

#[tokio::test]
async fn search_filters_then_paginates() {
    let store = InMemoryProfileStore::new().with_page_size(2);
    let users = Namespace::from(["users"]);
    for (key, plan) in [("a", "pro"), ("b", "free"), ("c", "pro"), ("d", "pro"), ("e", "free")] {
        store
            .put(&users, key, profile(json!({"plan": plan})))
            .await
            .expect("put");
    }

    let pro = search(
        &store,
        &users,
        SearchQuery::new().filter(ValueFilter::eq("plan", "pro")),
    )
    .await;
    assert_eq!(pro.len(), 3);

    let page = search(
        &store,
        &users,
        SearchQuery::new()
            .filter(ValueFilter::eq("plan", "pro"))
            .offset(1)
            .limit(1),
    )
    .await;
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].key, "c");
}

#[tokio::test]
async fn list_namespaces_respects_prefix_suffix_and_depth() {
    let store = InMemoryProfileStore::new();
    for namespace in [
        ["users", "alice", "memories"],
        ["users", "bob", "memories"],
        ["users", "bob", "settings"],
        ["teams", "core", "memories"],
    ] {
        store
            .put(&Namespace::from(namespace), "k", profile(json!({})))
            .await
            .expect("put");
    }

    let all = store
        .list_namespaces(NamespaceQuery::default())
        .await
        .expect("list");
    assert_eq!(all.len(), 4);

    let users_depth_two = store
        .list_namespaces(NamespaceQuery {
            prefix: Some(Namespace::from(["users"])),
            max_depth: Some(2),
            ..NamespaceQuery::default()
        })
        .await
        .expect("list");
    assert_eq!(
        users_depth_two,
        vec![Namespace::from(["users", "alice"]), Namespace::from(["users", "bob"])]
    );

    let memories = store
        .list_namespaces(NamespaceQuery {
            suffix: Some(Namespace::from(["memories"])),
            offset: 1,
            limit: Some(1),
            ..NamespaceQuery::default()
        })
        .await
        .expect("list");
    assert_eq!(memories, vec![Namespace::from(["users", "alice", "memories"])]);
}

#[tokio::test]
async fn empty_addresses_are_rejected() {
    let store = InMemoryProfileStore::new();

    let no_namespace = store
        .put(&Namespace::root(), "tom", profile(json!({})))
        .await
        .unwrap_err();
    let empty_segment = store
        .get(&Namespace::from(["users", ""]), "tom")
        .await
        .unwrap_err();
    let empty_key = store.delete(&Namespace::from(["users"]), "").await.unwrap_err();

    for err in [no_namespace, empty_segment, empty_key] {
        assert!(matches!(err, StoreError::Validation(_)), "{err}");
    }
}
