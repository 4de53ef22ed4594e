#![allow(missing_docs)]

use std::cell::Cell;
use std::rc::Rc;

use nimbus::graph::{ComputedGraph, GraphValue, LocationTypeBuilder};

/// A two-input adder: mutables `a` and `b`, cached property `sum`, and a
/// `doubled` property on top of `sum`.
fn adder_type(graph: &mut ComputedGraph) -> nimbus::graph::LocationTypeId {
    graph.register_location_type(
        LocationTypeBuilder::new("Adder")
            .key("name")
            .mutable("a", GraphValue::Int(0))
            .mutable("b", GraphValue::Int(0))
            .property("sum", |graph, location| {
                let a = graph.attribute(location, "a")?.as_int().unwrap_or(0);
                let b = graph.attribute(location, "b")?.as_int().unwrap_or(0);
                Ok(GraphValue::Int(a + b))
            })
            .property("doubled", |graph, location| {
                let sum = graph.attribute(location, "sum")?.as_int().unwrap_or(0);
                Ok(GraphValue::Int(sum * 2))
            }),
    )
}

#[test]
fn locations_dedupe_on_keys() {
    let mut graph = ComputedGraph::new();
    let adder = adder_type(&mut graph);

    let first = graph
        .get_location(adder, &[("name", GraphValue::str("x"))])
        .unwrap();
    let again = graph
        .get_location(adder, &[("name", GraphValue::str("x"))])
        .unwrap();
    let other = graph
        .get_location(adder, &[("name", GraphValue::str("y"))])
        .unwrap();

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(graph.attribute(first, "name").unwrap(), GraphValue::str("x"));
}

#[test]
fn properties_recompute_when_mutables_change() {
    let mut graph = ComputedGraph::new();
    let adder = adder_type(&mut graph);
    let location = graph
        .get_location(adder, &[("name", GraphValue::str("x"))])
        .unwrap();

    graph.set_attribute(location, "a", GraphValue::Int(3)).unwrap();
    graph.set_attribute(location, "b", GraphValue::Int(4)).unwrap();
    assert_eq!(graph.attribute(location, "sum").unwrap(), GraphValue::Int(7));
    assert_eq!(
        graph.attribute(location, "doubled").unwrap(),
        GraphValue::Int(14)
    );

    graph.set_attribute(location, "a", GraphValue::Int(10)).unwrap();
    assert!(graph.is_dirty(location, "sum"));
    // the edge that dirtied `sum` is the mutable `a`
    let dirtying = graph.properties_dirtying(location, "sum");
    assert_eq!(dirtying.len(), 1);
    assert_eq!(graph.dependencies_of(location, "sum").len(), 2);

    graph.flush_all();
    assert!(!graph.is_dirty(location, "sum"));
    assert_eq!(graph.attribute(location, "sum").unwrap(), GraphValue::Int(14));
    assert_eq!(
        graph.attribute(location, "doubled").unwrap(),
        GraphValue::Int(28)
    );

    // levels respect the dependency chain
    assert!(graph.level_of(location, "doubled") > graph.level_of(location, "sum"));
}

#[test]
fn root_subscriptions_fire_on_change_and_expire_on_drop() {
    let mut graph = ComputedGraph::new();
    let adder = adder_type(&mut graph);
    let location = graph
        .get_location(adder, &[("name", GraphValue::str("watched"))])
        .unwrap();

    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);
    let root = graph
        .subscribe(location, "sum", move || {
            counter.set(counter.get() + 1);
        })
        .unwrap();

    graph.set_attribute(location, "a", GraphValue::Int(5)).unwrap();
    graph.flush_all();
    assert_eq!(fired.get(), 1);

    // same value again: no recompute, no callback
    graph.set_attribute(location, "a", GraphValue::Int(5)).unwrap();
    graph.flush_all();
    assert_eq!(fired.get(), 1);

    drop(root);
    graph.set_attribute(location, "a", GraphValue::Int(6)).unwrap();
    graph.flush_all();
    assert_eq!(fired.get(), 1);
}

#[test]
fn mutable_hooks_observe_old_and_new_values() {
    let mut graph = ComputedGraph::new();
    let observed: Rc<Cell<(i64, i64)>> = Rc::new(Cell::new((0, 0)));
    let sink = Rc::clone(&observed);

    let watched = graph.register_location_type(
        LocationTypeBuilder::new("Watched")
            .key("id")
            .mutable_with_hook(
                "value",
                GraphValue::Int(0),
                Rc::new(move |_graph, _location, old, new| {
                    sink.set((
                        old.as_int().unwrap_or(i64::MIN),
                        new.as_int().unwrap_or(i64::MIN),
                    ));
                }),
            ),
    );
    let location = graph
        .get_location(watched, &[("id", GraphValue::Int(1))])
        .unwrap();

    graph.set_attribute(location, "value", GraphValue::Int(9)).unwrap();
    assert_eq!(observed.get(), (0, 9));

    graph.set_attribute(location, "value", GraphValue::Int(2)).unwrap();
    assert_eq!(observed.get(), (9, 2));
}

#[test]
fn self_referential_property_fails_with_a_rolled_back_read_set() {
    let mut graph = ComputedGraph::new();
    let looped = graph.register_location_type(
        LocationTypeBuilder::new("SelfLoop")
            .key("id")
            .property("recursive", |graph, location| {
                graph.attribute(location, "recursive")
            }),
    );
    let location = graph
        .get_location(looped, &[("id", GraphValue::Int(1))])
        .unwrap();

    let value = graph.attribute(location, "recursive").unwrap();
    assert!(value.is_error());
}

#[test]
fn mutual_recursion_is_replaced_with_the_cycle_sentinel() {
    let mut graph = ComputedGraph::new();
    // each property mirrors the other, falling back to the seed while the
    // other side is still mid-computation
    let paired = graph.register_location_type(
        LocationTypeBuilder::new("Paired")
            .key("id")
            .mutable("seed", GraphValue::Int(0))
            .property("ping", |graph, location| {
                match graph.attribute(location, "pong") {
                    Ok(value) => Ok(value),
                    Err(_) => graph.attribute(location, "seed"),
                }
            })
            .property("pong", |graph, location| {
                match graph.attribute(location, "ping") {
                    Ok(value) => Ok(value),
                    Err(_) => graph.attribute(location, "seed"),
                }
            }),
    );
    let location = graph
        .get_location(paired, &[("id", GraphValue::Int(1))])
        .unwrap();

    // first round establishes ping -> pong; recomputing pong afterwards
    // establishes pong -> ping, closing a true edge cycle
    let _ = graph.attribute(location, "ping");
    graph.set_attribute(location, "seed", GraphValue::Int(1)).unwrap();
    graph.flush_all();

    // with both members dirty at once, releveling can never settle and the
    // pending set is replaced with the sentinel
    graph.dirty_all();
    graph.flush_all();

    let ping = graph.attribute(location, "ping").unwrap();
    let pong = graph.attribute(location, "pong").unwrap();
    assert!(ping.is_cycle(), "ping is {ping:?}");
    assert!(pong.is_cycle(), "pong is {pong:?}");
}

#[test]
fn lazy_properties_wait_for_flush_lazy() {
    let mut graph = ComputedGraph::new();
    let computed = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&computed);

    let lazy_type = graph.register_location_type(
        LocationTypeBuilder::new("LazyHolder")
            .key("id")
            .mutable("input", GraphValue::Int(1))
            .lazy_property("expensive", move |graph, location| {
                counter.set(counter.get() + 1);
                let input = graph.attribute(location, "input")?.as_int().unwrap_or(0);
                Ok(GraphValue::Int(input * 100))
            }),
    );
    let location = graph
        .get_location(lazy_type, &[("id", GraphValue::Int(1))])
        .unwrap();

    // first sight initializes but does not compute
    let first = graph.attribute(location, "expensive").unwrap();
    assert_eq!(first, GraphValue::Nothing);
    graph.flush_all();
    assert_eq!(computed.get(), 0);

    graph.flush_lazy(None);
    assert_eq!(computed.get(), 1);
    assert_eq!(
        graph.attribute(location, "expensive").unwrap(),
        GraphValue::Int(100)
    );
}

#[test]
fn orphaned_properties_are_collected() {
    let mut graph = ComputedGraph::new();
    let adder = adder_type(&mut graph);
    let location = graph
        .get_location(adder, &[("name", GraphValue::str("orphan"))])
        .unwrap();

    graph.set_attribute(location, "a", GraphValue::Int(1)).unwrap();
    assert_eq!(graph.attribute(location, "sum").unwrap(), GraphValue::Int(1));

    let populated = graph.node_count();
    graph.flush_orphans();
    // `doubled` was never read, so `sum` had exactly one consumer path:
    // nothing depends on the cached `sum`, and it is collectable
    assert!(graph.node_count() < populated);

    // the mutables survive collection and the property recomputes on demand
    assert_eq!(graph.attribute(location, "sum").unwrap(), GraphValue::Int(1));
}

#[test]
fn flush_timeout_retains_partial_progress() {
    let mut graph = ComputedGraph::new();
    let adder = adder_type(&mut graph);

    let mut locations = Vec::new();
    for k in 0..50 {
        let location = graph
            .get_location(adder, &[("name", GraphValue::Int(k))])
            .unwrap();
        graph.set_attribute(location, "a", GraphValue::Int(k)).unwrap();
        let _ = graph.attribute(location, "sum");
        locations.push(location);
    }
    for location in &locations {
        graph
            .set_attribute(*location, "b", GraphValue::Int(100))
            .unwrap();
    }

    // a zero budget does nothing but must not lose the dirty state
    graph.flush(false, Some(std::time::Duration::from_secs(0)));
    assert!(locations.iter().any(|l| graph.is_dirty(*l, "sum")));

    graph.flush(false, None);
    for location in &locations {
        assert!(!graph.is_dirty(*location, "sum"));
    }
}

#[test]
fn unknown_attributes_delegate_through_defers_to() {
    let mut graph = ComputedGraph::new();

    let backing = graph.register_location_type(
        LocationTypeBuilder::new("Backing")
            .key("id")
            .class_attribute("shared", GraphValue::str("from backing")),
    );
    let backing_location = graph
        .get_location(backing, &[("id", GraphValue::Int(1))])
        .unwrap();

    let facade = graph.register_location_type(
        LocationTypeBuilder::new("Facade")
            .key("id")
            .property("target", move |_graph, _location| {
                Ok(GraphValue::Location(backing_location))
            })
            .defers_to("target"),
    );
    let facade_location = graph
        .get_location(facade, &[("id", GraphValue::Int(2))])
        .unwrap();

    assert_eq!(
        graph.attribute(facade_location, "shared").unwrap(),
        GraphValue::str("from backing")
    );
}
