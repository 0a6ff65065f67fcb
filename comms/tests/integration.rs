use std::{borrow::Cow, collections::BTreeMap, num::NonZeroUsize};

use comms::{
    Deserialize, FrameReceiver, FrameSender, Serialize,
    msg::{Command, LeafHeader, Msg, PartialHeader, Payload},
    specs::{ComponentSpec, MaskerSpec, ModeSpec, TaskSpec, WorkerSpec},
};
use serde_json::json;
use tokio::io;

fn worker_spec() -> WorkerSpec {
    let maskers = BTreeMap::from([(
        "constant".to_string(),
        MaskerSpec {
            granularity: "pixel".into(),
            baseline: Default::default(),
            segmenter: None,
        },
    )]);

    WorkerSpec {
        rank: 1,
        world_size: NonZeroUsize::new(2).unwrap(),
        device: 3,
        batch_size: NonZeroUsize::new(4).unwrap(),
        model: ComponentSpec::new("linear", json!({ "input_shape": [1, 2, 2], "num_classes": 3 })),
        dataset: ComponentSpec::new("synthetic", json!({ "len": 10 })),
        methods: BTreeMap::from([("random".into(), ComponentSpec::new("random", json!({})))]),
        task: TaskSpec::Deletion {
            mode: ModeSpec::Morf,
            start: 0.0,
            stop: 1.0,
            num_steps: 5,
            maskers,
            activation_fns: vec!["linear".into()],
            num_baseline_samples: 0,
        },
        seed: Some(7),
    }
}

fn partial_header(path_len: usize) -> PartialHeader {
    PartialHeader {
        rank: 0,
        indices: vec![0, 2],
        leaves: vec![
            LeafHeader {
                path: vec!["deletion".into(), "m".repeat(path_len)],
                shape: vec![2, 3],
            },
            LeafHeader {
                path: vec!["deletion".into(), "other".into()],
                shape: vec![2],
            },
        ],
    }
}

type Sender = FrameSender<io::WriteHalf<io::DuplexStream>>;
type Receiver = FrameReceiver<io::ReadHalf<io::DuplexStream>>;

/// The sending end of `one` and the receiving end of `two`.
fn pipe(one: io::DuplexStream, two: io::DuplexStream) -> (Sender, Receiver) {
    let (one_rx, one_tx) = io::split(one);
    let (_, sender) = comms::channel(one_rx, one_tx);
    let (two_rx, two_tx) = io::split(two);
    let (receiver, _) = comms::channel(two_rx, two_tx);
    (sender, receiver)
}

#[tokio::test]
async fn control_message_crosses_the_channel() {
    let (one, two) = io::duplex(64);
    let (mut tx, mut rx) = pipe(one, two);

    let spec = worker_spec();
    let msg = Msg::Control(Command::CreateWorker(Box::new(spec.clone())));

    let send = tx.send(&msg);
    let mut buf: Vec<u32> = Vec::new();
    let recv = rx.recv_into::<Msg, _>(&mut buf);
    let (sent, received) = tokio::join!(send, recv);
    sent.unwrap();

    match received.unwrap() {
        Msg::Control(Command::CreateWorker(got)) => assert_eq!(*got, spec),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn partial_values_arrive_aligned_for_any_header_length() {
    let values: Vec<f32> = (0..8).map(|v| v as f32 * 0.5).collect();

    for path_len in 1..6 {
        let (one, two) = io::duplex(1024);
        let (mut tx, mut rx) = pipe(one, two);

        let header = partial_header(path_len);
        let msg = Msg::Data(Payload::Partial {
            header: header.clone(),
            values: &values,
        });
        tx.send(&msg).await.unwrap();

        let mut buf: Vec<f32> = Vec::new();
        match rx.recv_into::<Msg, _>(&mut buf).await.unwrap() {
            Msg::Data(Payload::Partial {
                header: got,
                values: got_values,
            }) => {
                assert_eq!(got, header);
                assert_eq!(got_values, values.as_slice());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn error_message_keeps_its_text() {
    let (one, two) = io::duplex(64);
    let (mut tx, mut rx) = pipe(one, two);

    tx.send(&Msg::Err(Cow::Borrowed("model failed"))).await.unwrap();

    let mut buf: Vec<u32> = Vec::new();
    match rx.recv_into::<Msg, _>(&mut buf).await.unwrap() {
        Msg::Err(detail) => assert_eq!(detail, "model failed"),
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test]
async fn closed_peer_is_reported_as_eof() {
    let (one, two) = io::duplex(64);
    drop(one);
    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn partial_with_missing_values_is_rejected() {
    let header = partial_header(1);
    let values = [1.0f32; 3];
    let msg = Msg::Data(Payload::Partial {
        header,
        values: &values,
    });

    let mut frame = Vec::new();
    let trailer = msg.serialize(&mut frame).unwrap().unwrap();

    let mut words = vec![0u32; (frame.len() + trailer.len()).div_ceil(4)];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    bytes[..frame.len()].copy_from_slice(&frame);
    bytes[frame.len()..frame.len() + trailer.len()].copy_from_slice(trailer);

    let err = Msg::deserialize(&bytes[..frame.len() + trailer.len()]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
