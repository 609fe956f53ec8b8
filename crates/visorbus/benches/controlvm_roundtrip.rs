use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use visorbus::controlvm::{
    ControlVmChannel, ControlVmCommand, ControlVmLayout, ControlVmMessage, ControlVmPayload,
    ControlVmQueue, IrqInfo,
};
use visorbus::header::VHBA_CHANNEL_TYPE;
use visorbus::{Guid, RecordingDiagnostics, SharedRegion};

fn device_create() -> ControlVmMessage {
    ControlVmMessage::request(
        ControlVmCommand::DeviceCreate {
            bus_no: 1,
            dev_no: 2,
            channel_addr: 0x10_0000,
            channel_bytes: 0x2000,
            data_type: VHBA_CHANNEL_TYPE,
            dev_instance: Guid::NIL,
            intr: IrqInfo::default(),
        },
        7,
    )
}

fn benchmark_codec(c: &mut Criterion) {
    let msg = device_create();
    let raw = msg.encode();

    c.bench_function("controlvm_encode", |b| b.iter(|| black_box(msg).encode()));
    c.bench_function("controlvm_decode", |b| {
        b.iter(|| ControlVmMessage::decode(black_box(&raw)).unwrap())
    });

    let payload = ControlVmPayload {
        name: Some("vhba-0".into()),
        client: Some("guest-partition-3".into()),
        initiator: Some("iqn.2024-01.local:init".into()),
        ..ControlVmPayload::default()
    };
    let bytes = payload.encode();
    c.bench_function("controlvm_payload_parse", |b| {
        b.iter(|| ControlVmPayload::parse(black_box(&bytes)).unwrap())
    });
}

fn benchmark_request_response(c: &mut Criterion) {
    let layout = ControlVmLayout {
        request_payload_bytes: 4096,
        event_payload_bytes: 4096,
    };
    let cvm = ControlVmChannel::create(
        SharedRegion::anonymous(layout.total_size()).unwrap(),
        &layout,
        Arc::new(RecordingDiagnostics::new()),
    )
    .unwrap();
    let msg = device_create();

    c.bench_function("controlvm_request_response", |b| {
        b.iter(|| {
            cvm.send(ControlVmQueue::Request, &msg).unwrap();
            let req = cvm.try_receive(ControlVmQueue::Request).unwrap().unwrap();
            cvm.send(ControlVmQueue::Response, &req.response(Default::default(), false))
                .unwrap();
            black_box(cvm.try_receive(ControlVmQueue::Response).unwrap())
        });
    });
}

criterion_group!(benches, benchmark_codec, benchmark_request_response);
criterion_main!(benches);
