//! Property tests: arbitrary composite trees always run to a final outcome

mod common;

use common::*;
use corewf::runtime::{
    Activity, ActivityExecutor, Bookmark, BookmarkResumptionResult, RunOutcome, Value,
    WorkflowDefinition, WorkflowInstanceId,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Shape {
    Record,
    Throw,
    Seq(Vec<Shape>),
    Par(Vec<Shape>),
    Catch(Box<Shape>),
}

impl Shape {
    fn build(&self) -> Activity {
        match self {
            Shape::Record => record("leaf"),
            Shape::Throw => throw("boom"),
            Shape::Seq(children) => sequence("seq", children.iter().map(Shape::build).collect::<Vec<_>>()),
            Shape::Par(children) => parallel("par", children.iter().map(Shape::build).collect::<Vec<_>>()),
            Shape::Catch(body) => try_catch(body.build()),
        }
    }

    fn records(&self) -> usize {
        match self {
            Shape::Record => 1,
            Shape::Throw => 0,
            Shape::Seq(children) | Shape::Par(children) => {
                children.iter().map(Shape::records).sum()
            }
            Shape::Catch(body) => body.records(),
        }
    }

    fn throws(&self) -> bool {
        match self {
            Shape::Record => false,
            Shape::Throw => true,
            Shape::Seq(children) | Shape::Par(children) => children.iter().any(Shape::throws),
            Shape::Catch(body) => body.throws(),
        }
    }

    /// Whether a fault can reach the root
    fn escapes(&self) -> bool {
        match self {
            Shape::Record => false,
            Shape::Throw => true,
            Shape::Seq(children) | Shape::Par(children) => children.iter().any(Shape::escapes),
            Shape::Catch(_) => false,
        }
    }
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = prop_oneof![4 => Just(Shape::Record), 1 => Just(Shape::Throw)];
    leaf.prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Shape::Seq),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Shape::Par),
            inner.prop_map(|body| Shape::Catch(Box::new(body))),
        ]
    })
}

const WAITS: [&str; 5] = ["w0", "w1", "w2", "w3", "w4"];

proptest! {
    #[test]
    fn test_composite_trees_terminate(shape in shape()) {
        let journal = Journal::new();
        let definition = WorkflowDefinition::prepare(shape.build());
        let mut executor =
            ActivityExecutor::new(WorkflowInstanceId::new(), definition, BTreeMap::new())
                .unwrap()
                .with_extensions(extensions(&journal));

        let outcome = executor.run().unwrap();
        prop_assert!(outcome.is_completed());
        prop_assert!(executor.state().is_completed());
        prop_assert!(executor.bookmarks().is_empty());

        if shape.escapes() {
            prop_assert!(matches!(outcome, RunOutcome::Faulted(_)));
        } else {
            prop_assert!(matches!(outcome, RunOutcome::Completed { .. }), "expected completion");
        }
        if !shape.throws() {
            let leaves = journal.entries().iter().filter(|entry| *entry == "leaf").count();
            prop_assert_eq!(leaves, shape.records());
        }
    }

    #[test]
    fn test_resumption_order_is_preserved(order in Just(WAITS.to_vec()).prop_shuffle()) {
        let journal = Journal::new();
        let root = parallel("all", WAITS.iter().map(|name| wait(*name)).collect::<Vec<_>>());
        let mut executor = ActivityExecutor::new(
            WorkflowInstanceId::new(),
            WorkflowDefinition::prepare(root),
            BTreeMap::new(),
        )
        .unwrap()
        .with_extensions(extensions(&journal));
        prop_assert!(matches!(executor.run().unwrap(), RunOutcome::Idle));

        for name in &order {
            prop_assert_eq!(
                executor.resume_bookmark(&Bookmark::new(*name), Value::symbol(*name)),
                BookmarkResumptionResult::Success
            );
        }
        prop_assert!(matches!(executor.run().unwrap(), RunOutcome::Completed { .. }), "expected completion");

        let expected: Vec<String> = order.iter().map(|name| format!("resumed:{}", name)).collect();
        prop_assert_eq!(journal.entries(), expected);
    }
}
