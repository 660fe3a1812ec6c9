#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use slotflow::{
    config::EngineConfig,
    engine::{Engine, ExecutionEvent, Phase},
    error::EngineError,
    tensor::{Shape, Tensor},
    types::{NodeId, NodeKind, UnitType},
};
use std::sync::{Arc, Mutex};

type Recorded = Arc<Mutex<Vec<(usize, Vec<f64>)>>>;

#[allow(clippy::cast_precision_loss)]
fn fill_with_epoch(epoch: usize, output: &mut Tensor<f64>) {
    output.fill(epoch as f64);
}

fn double(inputs: &[&Tensor<f64>], output: &mut Tensor<f64>) {
    for (y, &x) in output.data_mut().iter_mut().zip(inputs[0].data()) {
        *y = 2.0 * x;
    }
}

fn recorder(engine: &mut Engine<f64>, predecessor: NodeId) -> (NodeId, Recorded) {
    let recorded = Recorded::default();
    let sink = {
        let recorded = recorded.clone();
        engine
            .sink(&[predecessor], move |inputs, epoch| {
                recorded
                    .lock()
                    .unwrap()
                    .push((epoch, inputs[0].data().to_vec()));
            })
            .unwrap()
    };
    (sink, recorded)
}

/// source → hidden (×2) → sink, with a (2, 3) tensor per epoch.
fn chain() -> (Engine<f64>, [NodeId; 3], Recorded) {
    let mut engine = Engine::new();
    let source = engine.source([2, 3], 1, fill_with_epoch);
    let hidden = engine.hidden(&[source], [2, 3], double).unwrap();
    let (sink, recorded) = recorder(&mut engine, hidden);
    (engine, [source, hidden, sink], recorded)
}

#[test]
fn declarations_insert_one_copy_per_edge() {
    let (engine, [source, hidden, sink], _) = chain();

    assert_eq!(source, NodeId::new(UnitType::Placeholder, 0));
    assert_eq!(hidden, NodeId::new(UnitType::Elementwise, 0));
    assert_eq!(sink, NodeId::new(UnitType::Collector, 0));
    assert_eq!(engine.count(NodeKind::Source), 1);
    assert_eq!(engine.count(NodeKind::Hidden), 1);
    assert_eq!(engine.count(NodeKind::Sink), 1);
    assert_eq!(engine.count(NodeKind::Copy), 2);

    let into_hidden = engine.in_copies(hidden).unwrap();
    let into_sink = engine.in_copies(sink).unwrap();
    assert_eq!(engine.copy_endpoints(into_hidden[0]), Some((source, hidden)));
    assert_eq!(engine.copy_endpoints(into_sink[0]), Some((hidden, sink)));
    assert_eq!(engine.in_copies(source), None);

    assert_eq!(engine.layout(hidden), Some((&Shape::from([2, 3]), 1)));
    assert_eq!(engine.layout(sink), None);
    for id in [source, hidden, sink, into_hidden[0], into_sink[0]] {
        assert_eq!(engine.epoch_of(id), Some(0), "{id}");
    }
    assert_eq!(engine.input_version(sink, 0), Some(0));
    assert_eq!(engine.input_version(sink, 1), None);
}

#[test]
fn cooperative_run_delivers_every_epoch_once() {
    let (mut engine, [source, hidden, sink], recorded) = chain();

    let report = engine.execute(5).expect("run completes");
    assert_eq!(report.epochs, 5);
    assert_eq!(report.computed, 15);
    assert_eq!(report.copied, 10);

    for id in [source, hidden, sink] {
        assert_eq!(engine.epoch_of(id), Some(5), "{id}");
    }
    for copy in engine.in_copies(sink).unwrap() {
        assert_eq!(engine.epoch_of(copy), Some(5));
    }
    assert_eq!(engine.input_version(hidden, 0), Some(5));
    assert_eq!(engine.input_version(sink, 0), Some(5));

    let recorded = recorded.lock().unwrap();
    let expected: Vec<(usize, Vec<f64>)> = (0..5)
        .map(|epoch| (epoch, vec![2.0 * epoch as f64; 6]))
        .collect();
    assert_eq!(*recorded, expected);

    let (last_input, _) = engine.input(hidden, 0).unwrap();
    assert_eq!(last_input.data(), &[4.0; 6]);
    assert_eq!(engine.output(hidden).unwrap().data(), &[8.0; 6]);
}

#[test]
fn repeated_runs_target_an_absolute_epoch() {
    let (mut engine, [_, _, sink], recorded) = chain();

    assert_eq!(engine.execute(2).unwrap().epochs, 2);
    assert_eq!(engine.execute(5).unwrap().epochs, 5);
    assert_eq!(engine.epoch_of(sink), Some(5));

    let epochs: Vec<usize> = recorded.lock().unwrap().iter().map(|(e, _)| *e).collect();
    assert_eq!(epochs, vec![0, 1, 2, 3, 4]);

    // The same target again, or a lower one, has nothing left to do.
    let report = engine.execute(5).unwrap();
    assert_eq!(report.computed + report.copied, 0);
    assert_eq!(engine.execute_parallel(2, 3).unwrap().computed, 0);
    assert_eq!(engine.epoch_of(sink), Some(5));
    assert_eq!(recorded.lock().unwrap().len(), 5);
}

#[test]
fn empty_engine_finishes_immediately() {
    let mut engine = Engine::<f32>::new();
    let report = engine.execute(3).unwrap();
    assert_eq!(report.computed + report.copied, 0);
    assert_eq!(engine.execute_parallel(2, 3).unwrap().rounds, 0);
}

#[test]
fn parallel_run_delivers_every_epoch_once() {
    let (mut engine, [source, hidden, sink], recorded) = chain();

    let report = engine.execute_parallel(4, 5).expect("run completes");
    assert_eq!(report.epochs, 5);
    assert_eq!(report.computed, 15);
    assert_eq!(report.copied, 10);

    for id in [source, hidden, sink] {
        assert_eq!(engine.epoch_of(id), Some(5), "{id}");
    }
    assert_eq!(engine.input_version(sink, 0), Some(5));

    let mut recorded = recorded.lock().unwrap().clone();
    recorded.sort_by_key(|(epoch, _)| *epoch);
    let expected: Vec<(usize, Vec<f64>)> = (0..5)
        .map(|epoch| (epoch, vec![2.0 * epoch as f64; 6]))
        .collect();
    assert_eq!(recorded, expected);
}

/// Two sources feeding `(a × b) + c`, recorded by one sink.
fn diamond(engine: &mut Engine<f64>) -> Recorded {
    let a = engine.source([2, 3], 2, |epoch, output: &mut Tensor<f64>| {
        for (i, x) in output.data_mut().iter_mut().enumerate() {
            *x = (i + epoch) as f64;
        }
    });
    let b = engine.source([3, 2], 2, |epoch, output: &mut Tensor<f64>| {
        for (i, x) in output.data_mut().iter_mut().enumerate() {
            *x = (i * (epoch + 1)) as f64 * 0.5;
        }
    });
    let c = engine.constant(Tensor::from_vec(
        Shape::from([2, 2]),
        2,
        vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0],
    ));
    let product = engine.multiply(a, b).unwrap();
    let sum = engine.add(product, c).unwrap();
    recorder(engine, sum).1
}

#[test]
fn parallel_and_cooperative_runs_agree() {
    let mut cooperative = Engine::new();
    let expected = diamond(&mut cooperative);
    cooperative.execute(6).unwrap();

    let mut parallel = Engine::with_config(EngineConfig::default().with_queue_capacity(2));
    let actual = diamond(&mut parallel);
    parallel.execute_parallel(3, 6).unwrap();

    let expected = expected.lock().unwrap().clone();
    let mut actual = actual.lock().unwrap().clone();
    actual.sort_by_key(|(epoch, _)| *epoch);
    assert_eq!(expected.len(), 6);
    assert_eq!(actual, expected);
}

#[test]
fn multiply_computes_batched_matrix_products() {
    let mut engine = Engine::<f64>::new();
    let lhs = engine.constant(Tensor::from_vec(
        Shape::from([2, 3]),
        2,
        vec![
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, //
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0,
        ],
    ));
    let rhs = engine.constant(Tensor::from_vec(
        Shape::from([3, 2]),
        2,
        vec![
            7.0, 8.0, 9.0, 10.0, 11.0, 12.0, //
            7.0, 8.0, 9.0, 10.0, 11.0, 12.0,
        ],
    ));
    let product = engine.multiply(lhs, rhs).unwrap();
    assert_eq!(product, NodeId::new(UnitType::Multiply, 0));
    assert_eq!(engine.layout(product), Some((&Shape::from([2, 2]), 2)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        engine
            .output_test(product, move |output, epoch| {
                assert_eq!(epoch, 0);
                seen.lock().unwrap().extend_from_slice(output.data());
            })
            .unwrap();
    }
    engine.execute(1).unwrap();

    let expected = [58.0, 64.0, 139.0, 154.0, 7.0, 8.0, 9.0, 10.0];
    assert_eq!(engine.output(product).unwrap().data(), &expected);
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[test]
fn operand_errors() {
    let mut engine = Engine::<f32>::new();
    let a = engine.source([2, 3], 1, |_, _: &mut Tensor<f32>| {});
    let b = engine.source([2, 3], 1, |_, _: &mut Tensor<f32>| {});
    let wide = engine.source([2, 3], 4, |_, _: &mut Tensor<f32>| {});
    let cube = engine.source([2, 2, 2], 1, |_, _: &mut Tensor<f32>| {});
    let column = engine.source([3], 1, |_, _: &mut Tensor<f32>| {});

    assert_eq!(
        engine.multiply(a, b).unwrap_err(),
        EngineError::ShapeMismatch {
            node: NodeId::new(UnitType::Multiply, 0),
            lhs: Shape::from([2, 3]),
            rhs: Shape::from([2, 3]),
        }
    );
    assert!(matches!(
        engine.multiply(cube, cube),
        Err(EngineError::ShapeMismatch { .. })
    ));
    let empty = engine.source(Shape::empty(), 1, |_, _: &mut Tensor<f32>| {});
    assert_eq!(
        engine.multiply(empty, empty).unwrap_err(),
        EngineError::ShapeMismatch {
            node: NodeId::new(UnitType::Multiply, 0),
            lhs: Shape::empty(),
            rhs: Shape::empty(),
        }
    );
    let flat = engine.source([0, 3], 1, |_, _: &mut Tensor<f32>| {});
    let thin = engine.source([3, 0], 1, |_, _: &mut Tensor<f32>| {});
    assert!(matches!(
        engine.multiply(flat, thin),
        Err(EngineError::ShapeMismatch { .. })
    ));
    let transposed = engine.source([3, 2], 4, |_, _: &mut Tensor<f32>| {});
    assert_eq!(
        engine.multiply(a, transposed).unwrap_err(),
        EngineError::BatchSizeMismatch {
            node: NodeId::new(UnitType::Multiply, 0),
            lhs: 1,
            rhs: 4,
        }
    );

    assert!(matches!(
        engine.add(a, column),
        Err(EngineError::ShapeMismatch { .. })
    ));
    assert_eq!(
        engine.add(a, wide).unwrap_err(),
        EngineError::BatchSizeMismatch {
            node: NodeId::new(UnitType::Add, 0),
            lhs: 1,
            rhs: 4,
        }
    );
    assert!(matches!(
        engine.hidden(&[a, wide], [2, 3], |_, _| {}),
        Err(EngineError::BatchSizeMismatch { .. })
    ));

    // Failed declarations leave nothing behind.
    assert_eq!(engine.count(NodeKind::Hidden), 0);
    assert_eq!(engine.count(NodeKind::Copy), 0);
    assert!(engine.add(a, b).is_ok());
}

#[test]
fn connection_errors() {
    let mut engine = Engine::<f32>::new();
    let source = engine.source([1], 1, |_, _: &mut Tensor<f32>| {});
    let sink = engine.sink(&[source], |_, _| {}).unwrap();

    assert_eq!(
        engine.hidden(&[], [1], |_, _| {}).unwrap_err(),
        EngineError::NoPredecessors(NodeId::new(UnitType::Elementwise, 0))
    );
    assert_eq!(
        engine.sink(&[], |_, _| {}).unwrap_err(),
        EngineError::NoPredecessors(NodeId::new(UnitType::Collector, 1))
    );
    assert_eq!(
        engine.hidden(&[sink], [1], |_, _| {}).unwrap_err(),
        EngineError::UnsupportedConnection {
            consumer: NodeId::new(UnitType::Elementwise, 0),
            producer: sink,
        }
    );
    let copy = engine.in_copies(sink).unwrap()[0];
    assert!(matches!(
        engine.output_test(copy, |_, _| {}),
        Err(EngineError::UnsupportedConnection { .. })
    ));
    let ghost = NodeId::new(UnitType::Placeholder, 9);
    assert_eq!(
        engine.hidden(&[ghost], [1], |_, _| {}).unwrap_err(),
        EngineError::UnknownNode(ghost)
    );
    assert_eq!(
        engine.execute_parallel(0, 1).unwrap_err(),
        EngineError::NoWorkers
    );
}

#[test]
fn abort_from_inside_a_sink_stops_the_cooperative_run() {
    let mut engine = Engine::<f64>::new();
    let source = engine.source([1], 1, fill_with_epoch);
    let handle = engine.abort_handle();
    let sink = {
        let handle = handle.clone();
        engine
            .output_test(source, move |_, epoch| {
                if epoch == 2 {
                    handle.abort();
                }
            })
            .unwrap()
    };

    let err = engine.execute(10).unwrap_err();
    assert!(matches!(err, EngineError::Aborted { .. }), "{err}");
    assert!(handle.is_aborted());
    assert_eq!(engine.epoch_of(sink), Some(3));

    // A new run clears the abort and carries every node up to the target.
    let report = engine.execute(5).unwrap();
    assert!(!handle.is_aborted());
    assert_eq!(report.epochs, 5);
    assert_eq!(engine.epoch_of(sink), Some(5));
}

#[test]
fn abort_from_inside_a_sink_stops_the_parallel_run() {
    let mut engine = Engine::<f64>::new();
    let source = engine.source([1], 1, fill_with_epoch);
    let hidden = engine.hidden(&[source], [1], double).unwrap();
    let handle = engine.abort_handle();
    let sink = {
        let handle = handle.clone();
        engine
            .output_test(hidden, move |_, epoch| {
                if epoch == 1 {
                    handle.abort();
                }
            })
            .unwrap()
    };

    let err = engine.execute_parallel(2, 100).unwrap_err();
    assert!(matches!(err, EngineError::Aborted { .. }), "{err}");
    assert_eq!(engine.epoch_of(sink), Some(2));
}

#[test]
fn panicking_kernel_is_reported() {
    let mut engine = Engine::<f64>::new();
    let source = engine.source([1], 1, fill_with_epoch);
    let hidden = engine
        .hidden(&[source], [1], |_, _| panic!("kernel exploded"))
        .unwrap();
    engine.sink(&[hidden], |_, _| {}).unwrap();

    assert_eq!(
        engine.execute_parallel(2, 3).unwrap_err(),
        EngineError::TaskPanicked {
            node: hidden,
            message: "kernel exploded".to_owned(),
        }
    );
    assert_eq!(engine.epoch_of(hidden), Some(0));
}

#[test]
fn observer_sees_compute_and_copy_phases_separated_by_barriers() {
    let (mut engine, _, _) = chain();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        engine.set_observer(move |event| events.lock().unwrap().push(event.clone()));
    }

    let report = engine.execute_parallel(2, 4).unwrap();
    let events = events.lock().unwrap();

    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::Started { target: 4, .. })
    ));
    assert_eq!(
        events.last(),
        Some(&ExecutionEvent::Finished {
            rounds: report.rounds
        })
    );

    // Between two barriers only tasks of the phase the later barrier closes
    // may finish, and exactly as many as it waited for.
    let mut since_barrier: Vec<Phase> = Vec::new();
    let mut compute = 0;
    let mut copy = 0;
    for event in &events[1..events.len() - 1] {
        match event {
            ExecutionEvent::TaskFinished { phase, .. } => since_barrier.push(*phase),
            ExecutionEvent::RoundFinished { phase, tasks, .. } => {
                assert_eq!(since_barrier.len(), *tasks);
                assert!(since_barrier.iter().all(|p| p == phase));
                match phase {
                    Phase::Compute => compute += tasks,
                    Phase::Copy => copy += tasks,
                }
                since_barrier.clear();
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(since_barrier.is_empty());
    assert_eq!((compute, copy), (report.computed, report.copied));
    assert_eq!((compute, copy), (12, 8));
}

#[test]
fn cooperative_observer_reports_every_step() {
    let (mut engine, [source, _, sink], _) = chain();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        engine.set_observer(move |event| events.lock().unwrap().push(event.clone()));
    }
    engine.execute(2).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events[0],
        ExecutionEvent::Started {
            target: 2,
            workers: 1
        }
    );
    let steps = |node: NodeId| {
        events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::TaskFinished { node: n, .. } if *n == node))
            .count()
    };
    assert_eq!(steps(source), 2);
    assert_eq!(steps(sink), 2);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::Finished { .. })
    ));
}
