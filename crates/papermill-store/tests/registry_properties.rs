//! Registry behaviour across commits, reopen and concurrency

use papermill_store::{Action, DataLayout, Registry, RegistryConfig};
use papermill_types::{ExtractionTarget, ExtractionTargetSet, Grouping, Item, ItemMetadata, TargetHash};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

fn targets(instruction: &str) -> TargetHash {
    ExtractionTargetSet::new()
        .with_target(ExtractionTarget::new("datasets", instruction))
        .hash()
}

async fn registry(layout: &DataLayout) -> Registry {
    Registry::open(layout.registry_entries(), RegistryConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn commit_then_classify_same_inputs_is_skip() {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry(&DataLayout::new(dir.path())).await;
    let item = Item::new(ItemMetadata::titled("BERT")).with_doi("10.18653/v1/N19-1423");
    let g = Grouping::new("nlp");
    let h = targets("v1");

    assert_eq!(reg.classify(&item, &h, &g).action, Action::New);
    reg.commit(&item, &g, &h, None).await.unwrap();
    assert_eq!(reg.classify(&item, &h, &g).action, Action::Skip);
}

#[tokio::test]
async fn changed_targets_classify_as_backfill() {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry(&DataLayout::new(dir.path())).await;
    let item = Item::new(ItemMetadata::titled("BERT")).with_doi("10.18653/v1/N19-1423");
    let g = Grouping::new("nlp");

    reg.commit(&item, &g, &targets("v1"), None).await.unwrap();
    let c = reg.classify(&item, &targets("v2"), &g);
    assert_eq!(c.action, Action::Backfill);

    let updated = reg.commit(&item, &g, &targets("v2"), c.existing.as_ref()).await.unwrap();
    assert_eq!(updated.target_hash, targets("v2"));
    assert_eq!(reg.classify(&item, &targets("v2"), &g).action, Action::Skip);
}

#[tokio::test]
async fn new_grouping_is_map_only_and_commit_adds_it() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let reg = registry(&layout).await;
    let item = Item::new(ItemMetadata::titled("ResNet")).with_provider_id("arxiv:1512.03385");
    let h = targets("v1");

    reg.commit(&item, &Grouping::new("vision"), &h, None).await.unwrap();
    let c = reg.classify(&item, &h, &Grouping::new("classics"));
    assert_eq!(c.action, Action::MapOnly);
    reg.commit(&item, &Grouping::new("classics"), &h, c.existing.as_ref())
        .await
        .unwrap();

    let reopened = registry(&layout).await;
    let stats = reopened.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.groupings.get("vision"), Some(&1));
    assert_eq!(stats.groupings.get("classics"), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_new_commits_merge_into_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let reg = Arc::new(registry(&DataLayout::new(dir.path())).await);
    let g = Grouping::new("nlp");
    let h = targets("v1");

    let mut handles = Vec::new();
    for i in 0..8 {
        let reg = Arc::clone(&reg);
        let (g, h) = (g.clone(), h);
        handles.push(tokio::spawn(async move {
            let item = Item::new(ItemMetadata::titled("GPT-2"))
                .with_doi("10.1/gpt2")
                .with_provider_id(&format!("mirror:{i}"));
            reg.commit(&item, &g, &h, None).await.unwrap()
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.stats().provider_ids, 8);
    assert_eq!(std::fs::read_dir(reg.dir()).unwrap().count(), 1);
}

fn item_strategy() -> impl Strategy<Value = Item> {
    (
        "[A-Za-z ]{3,30}",
        proptest::option::of("[a-z0-9]{1,8}"),
        proptest::option::of("[0-9]{1,6}"),
    )
        .prop_map(|(title, doi, pid)| {
            let mut item = Item::new(ItemMetadata::titled(title));
            if let Some(doi) = doi {
                item = item.with_doi(&format!("10.1234/{doi}"));
            }
            if let Some(pid) = pid {
                item = item.with_provider_id(&format!("arxiv:{pid}"));
            }
            item
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn classification_is_idempotent(
        committed in proptest::collection::vec(item_strategy(), 0..6),
        candidate in item_strategy(),
        same_hash in any::<bool>(),
        same_grouping in any::<bool>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let reg = registry(&DataLayout::new(dir.path())).await;
            for item in &committed {
                reg.commit(item, &Grouping::new("base"), &targets("v1"), None).await.unwrap();
            }

            let h = if same_hash { targets("v1") } else { targets("v2") };
            let g = Grouping::new(if same_grouping { "base" } else { "other" });
            let first = reg.classify(&candidate, &h, &g);
            let second = reg.classify(&candidate, &h, &g);
            assert_eq!(first, second);
            assert_eq!(reg.len(), reg.stats().entries);
        });
    }
}
