use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use search_backends::{SearchBackend, SessionState, SqliteBackend, SqliteParams, TantivyBackend, TantivyParams};
use search_model::{Condition, Document, Field, Query, Schema, SearchError, SortOrder, Value};

type Factory = fn(&Path) -> Box<dyn SearchBackend>;

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .field("id", Field::identifier().stored())
            .field("title", Field::long_text().stored().sortable())
            .field("price", Field::numeric().stored())
            .field("body", Field::long_text())
            .field("city", Field::short_text().stored())
            .build()
            .unwrap(),
    )
}

fn tantivy(dir: &Path) -> Box<dyn SearchBackend> {
    Box::new(TantivyBackend::new("db", schema(), TantivyParams::new(dir)).unwrap())
}

fn sqlite(dir: &Path) -> Box<dyn SearchBackend> {
    Box::new(SqliteBackend::new("db", schema(), SqliteParams::new(dir)).unwrap())
}

const ENGINES: [(&str, Factory); 2] = [("tantivy", tantivy), ("sqlite", sqlite)];

fn doc(id: &str, title: &str, price: i64) -> Document {
    Document::new().with("id", id).with("title", title).with("price", price).with("body", format!("notes for {id}"))
}

fn run(backend: &mut dyn SearchBackend, query: &Query, order: &SortOrder, page: usize, size: usize) -> (Vec<Document>, u64) {
    let mut cursor = backend.find(query, order).unwrap();
    let docs = cursor.page(page, size).unwrap();
    let total = cursor.total_rows().unwrap();
    (docs, total)
}

fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter().map(|d| d.get("id").unwrap().to_string()).collect()
}

fn seeded(factory: Factory, dir: &Path, docs: &[Document]) -> Box<dyn SearchBackend> {
    let mut b = factory(dir);
    for d in docs {
        b.add(d).unwrap();
    }
    b.commit().unwrap();
    b
}

#[test]
fn missing_identifier_is_rejected_before_writing() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = factory(tmp.path());
        let err = b.add(&Document::new().with("title", "orphan")).unwrap_err();
        assert!(matches!(err, SearchError::SchemaViolation(_)), "{engine}: {err}");
        assert_eq!(b.state(), SessionState::Closed, "{engine}");
    }
}

#[test]
fn stored_fields_survive_a_round_trip() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(factory, tmp.path(), &[doc("d1", "Big Apple", 42), doc("d2", "Pear", 7)]);
        let (docs, total) = run(b.as_mut(), &Query::and().filter("id", "d1"), &SortOrder::new(), 1, 20);
        assert_eq!(total, 1, "{engine}");
        let hit = &docs[0];
        assert!(hit.is_restored());
        assert_eq!(hit.get("id"), Some(&Value::from("d1")), "{engine}");
        assert_eq!(hit.get("title"), Some(&Value::from("Big Apple")), "{engine}");
        assert_eq!(hit.get("price"), Some(&Value::Integer(42)), "{engine}");
        // not stored
        assert_eq!(hit.get("body"), None, "{engine}");
    }
}

#[test]
fn sorting_text_ignores_case() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(factory, tmp.path(), &[doc("1", "cherry", 1), doc("2", "Banana", 2), doc("3", "apple", 3)]);
        let (docs, _) = run(b.as_mut(), &Query::and(), &SortOrder::new().asc("title"), 1, 10);
        let titles: Vec<String> = docs.iter().map(|d| d.get("title").unwrap().to_string()).collect();
        assert_eq!(titles, vec!["apple", "Banana", "cherry"], "{engine}");

        let (docs, _) = run(b.as_mut(), &Query::and(), &SortOrder::new().desc("price"), 1, 10);
        assert_eq!(ids(&docs), vec!["3", "2", "1"], "{engine}");
    }
}

#[test]
fn ranges_are_inclusive_at_both_ends() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let docs: Vec<Document> = [3, 5, 7, 10, 12].iter().map(|p| doc(&format!("p{p}"), "item", *p)).collect();
        let mut b = seeded(factory, tmp.path(), &docs);
        let q = Query::and().with(Condition::ge("price", 5)).with(Condition::le("price", 10));
        let (hits, total) = run(b.as_mut(), &q, &SortOrder::new().asc("price"), 1, 10);
        assert_eq!(total, 3, "{engine}");
        assert_eq!(ids(&hits), vec!["p5", "p7", "p10"], "{engine}");

        let q = Query::and().lookup("price__gt", 5).lookup("price__lt", 12).filter("title", "item");
        let (hits, _) = run(b.as_mut(), &q, &SortOrder::new().asc("price"), 1, 10);
        assert_eq!(ids(&hits), vec!["p7", "p10"], "{engine}");
    }
}

#[test]
fn second_writer_gets_lock_conflict() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut first = factory(tmp.path());
        first.open(true).unwrap();
        let mut second = factory(tmp.path());
        let err = second.open(true).unwrap_err();
        assert!(matches!(err, SearchError::LockConflict(_)), "{engine}: {err}");

        first.commit().unwrap();
        second.open(true).unwrap();
        second.rollback().unwrap();
    }
}

#[test]
fn pages_are_disjoint_with_stable_totals() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let docs: Vec<Document> = (0..25).map(|i| doc(&format!("d{i:02}"), "shared words", i)).collect();
        let mut b = seeded(factory, tmp.path(), &docs);
        let q = Query::and().filter("title", "shared");
        let order = SortOrder::new().asc("price");
        let mut cursor = b.find(&q, &order).unwrap();
        let first: BTreeSet<String> = ids(&cursor.page(1, 10).unwrap()).into_iter().collect();
        let second = cursor.page(2, 10).unwrap();
        assert_eq!(cursor.total_rows(), Some(25), "{engine}");
        assert_eq!(second.len(), 10, "{engine}");
        assert!(ids(&second).iter().all(|id| !first.contains(id)), "{engine}");
        assert_eq!(cursor.page(3, 10).unwrap().len(), 5, "{engine}");
        assert!(matches!(cursor.page(0, 10), Err(SearchError::InvalidQuery(_))), "{engine}");
    }
}

#[test]
fn removed_documents_stop_matching() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(factory, tmp.path(), &[doc("gone", "ephemeral", 1), doc("kept", "ephemeral", 2)]);
        b.remove("gone").unwrap();
        b.commit().unwrap();
        let (_, total) = run(b.as_mut(), &Query::and().filter("id", "gone"), &SortOrder::new(), 1, 10);
        assert_eq!(total, 0, "{engine}");
        let (_, total) = run(b.as_mut(), &Query::and().filter("title", "ephemeral"), &SortOrder::new(), 1, 10);
        assert_eq!(total, 1, "{engine}");
    }
}

#[test]
fn add_with_existing_identifier_replaces() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(factory, tmp.path(), &[doc("x", "first", 1)]);
        b.add(&doc("x", "second", 2)).unwrap();
        b.commit().unwrap();
        let (docs, total) = run(b.as_mut(), &Query::and(), &SortOrder::new(), 1, 10);
        assert_eq!(total, 1, "{engine}");
        assert_eq!(docs[0].get("title"), Some(&Value::from("second")), "{engine}");

        b.replace("x", &doc("y", "renamed", 3)).unwrap();
        b.commit().unwrap();
        let (docs, total) = run(b.as_mut(), &Query::and(), &SortOrder::new(), 1, 10);
        assert_eq!(total, 1, "{engine}");
        assert_eq!(ids(&docs), vec!["y"], "{engine}");
    }
}

#[test]
fn rollback_and_close_discard_pending_writes() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(factory, tmp.path(), &[doc("a", "alpha", 1)]);
        b.add(&doc("b", "beta", 2)).unwrap();
        b.rollback().unwrap();
        assert_eq!(b.state(), SessionState::Read, "{engine}");

        b.add(&doc("c", "gamma", 3)).unwrap();
        b.close().unwrap();
        assert_eq!(b.state(), SessionState::Closed, "{engine}");

        let mut reopened = factory(tmp.path());
        let (docs, total) = run(reopened.as_mut(), &Query::and(), &SortOrder::new(), 1, 10);
        assert_eq!(total, 1, "{engine}");
        assert_eq!(ids(&docs), vec!["a"], "{engine}");
    }
}

#[test]
fn commit_outside_a_write_session_is_invalid() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = factory(tmp.path());
        assert!(matches!(b.commit(), Err(SearchError::InvalidState(_))), "{engine}");
        b.open(false).unwrap();
        assert!(matches!(b.rollback(), Err(SearchError::InvalidState(_))), "{engine}");
    }
}

#[test]
fn unwritten_index_has_no_matches() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = factory(tmp.path());
        let (docs, total) = run(b.as_mut(), &Query::and().filter("title", "anything"), &SortOrder::new(), 1, 10);
        assert!(docs.is_empty(), "{engine}");
        assert_eq!(total, 0, "{engine}");
    }
}

#[test]
fn or_groups_and_subqueries_combine() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(
            factory,
            tmp.path(),
            &[doc("1", "red apple", 1), doc("2", "green apple", 2), doc("3", "red cherry", 3), doc("4", "plum", 4)],
        );
        let q = Query::or().filter("title", "cherry").filter("title", "plum");
        let (docs, _) = run(b.as_mut(), &q, &SortOrder::new().asc("price"), 1, 10);
        assert_eq!(ids(&docs), vec!["3", "4"], "{engine}");

        let q = Query::and().filter("title", "red").subquery(Query::or().filter("title", "apple").filter("title", "plum"));
        let (docs, _) = run(b.as_mut(), &q, &SortOrder::new(), 1, 10);
        assert_eq!(ids(&docs), vec!["1"], "{engine}");

        // every word of a multi-word value must match
        let (docs, _) = run(b.as_mut(), &Query::and().filter("title", "green apple"), &SortOrder::new(), 1, 10);
        assert_eq!(ids(&docs), vec!["2"], "{engine}");
    }
}

#[test]
fn sorting_on_unsortable_field_fails_at_find() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = factory(tmp.path());
        let err = b.find(&Query::and(), &SortOrder::new().asc("body")).err().unwrap();
        assert!(matches!(err, SearchError::SchemaViolation(_)), "{engine}: {err}");
    }
}

#[test]
fn numeric_equalities_follow_the_conjunction() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let docs: Vec<Document> = [3, 5, 7, 10].iter().map(|p| doc(&format!("p{p}"), "item", *p)).collect();
        let mut b = seeded(factory, tmp.path(), &docs);

        let q = Query::or().filter("price", 3).filter("price", 7);
        let (hits, total) = run(b.as_mut(), &q, &SortOrder::new().asc("price"), 1, 10);
        assert_eq!(total, 2, "{engine}");
        assert_eq!(ids(&hits), vec!["p3", "p7"], "{engine}");

        let q = Query::and().with(Condition::ge("price", 10)).filter("price", 7);
        let (hits, total) = run(b.as_mut(), &q, &SortOrder::new(), 1, 10);
        assert_eq!(total, 0, "{engine}");
        assert!(hits.is_empty(), "{engine}");

        let q = Query::or().filter("title", "nothing").subquery(Query::and().filter("price", 5).filter("title", "item"));
        let (hits, _) = run(b.as_mut(), &q, &SortOrder::new(), 1, 10);
        assert_eq!(ids(&hits), vec!["p5"], "{engine}");
    }
}

#[test]
fn unsplit_short_text_matches_whole_value_only() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(
            factory,
            tmp.path(),
            &[doc("ny", "city", 1).with("city", "New York"), doc("yk", "city", 2).with("city", "York")],
        );
        let (_, total) = run(b.as_mut(), &Query::and().filter("city", "New"), &SortOrder::new(), 1, 10);
        assert_eq!(total, 0, "{engine}");
        let (hits, total) = run(b.as_mut(), &Query::and().filter("city", "New York"), &SortOrder::new(), 1, 10);
        assert_eq!(total, 1, "{engine}");
        assert_eq!(ids(&hits), vec!["ny"], "{engine}");
        assert_eq!(hits[0].get("city"), Some(&Value::from("New York")), "{engine}");
        let (hits, _) = run(b.as_mut(), &Query::and().filter("city", "York"), &SortOrder::new(), 1, 10);
        assert_eq!(ids(&hits), vec!["yk"], "{engine}");
    }
}

#[test]
fn range_filters_do_not_leak_into_the_next_find() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let docs: Vec<Document> = [1, 5, 9].iter().map(|p| doc(&format!("p{p}"), "item", *p)).collect();
        let mut b = seeded(factory, tmp.path(), &docs);
        let (_, total) = run(b.as_mut(), &Query::and().with(Condition::ge("price", 5)), &SortOrder::new(), 1, 10);
        assert_eq!(total, 2, "{engine}");
        let (hits, total) = run(b.as_mut(), &Query::and(), &SortOrder::new().asc("price"), 1, 10);
        assert_eq!(total, 3, "{engine}");
        assert_eq!(ids(&hits), vec!["p1", "p5", "p9"], "{engine}");
    }
}

#[test]
fn unsorted_text_matches_rank_by_relevance() {
    for (engine, factory) in ENGINES {
        let tmp = tempfile::tempdir().unwrap();
        let mut b = seeded(
            factory,
            tmp.path(),
            &[doc("weak", "apple pie with a long list of other words in it", 1), doc("strong", "apple apple", 2)],
        );
        let (hits, total) = run(b.as_mut(), &Query::and().filter("title", "apple"), &SortOrder::new(), 1, 10);
        assert_eq!(total, 2, "{engine}");
        assert_eq!(ids(&hits), vec!["strong", "weak"], "{engine}");
    }
}
