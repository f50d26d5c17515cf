use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ferrite::value::Value;
use ferrite::wire::buffer::RingBuffer;
use ferrite::wire::{decode, encode, Message};

fn bench_ring_buffer_push_and_drain(c: &mut Criterion) {
    let payload = vec![0xABu8; 512];

    c.bench_function("ring_buffer_push_drain_512b", |b| {
        b.iter(|| {
            let mut buffer = RingBuffer::new(1024);
            buffer.push(black_box(&payload));
            buffer.move_head(buffer.len());
        })
    });
}

fn bench_message_roundtrip(c: &mut Criterion) {
    let message = Message::EntryUpdate {
        send_time: 1_700_000_000_000,
        id: 42,
        value: Value::Raw(b"the quick brown fox".to_vec()),
    };

    c.bench_function("encode_entry_update", |b| {
        b.iter(|| black_box(encode(black_box(&message), 1024)))
    });

    let encoded = encode(&message, 1024).expect("message fits one frame");
    // the frame header's type tag isn't part of the codec benchmark; the
    // payload starts right after it.
    let type_tag = ferrite::wire::MessageKind::EntryUpdate.tag();

    c.bench_function("decode_entry_update", |b| {
        b.iter(|| black_box(decode(black_box(type_tag), black_box(&encoded))))
    });
}

criterion_group!(benches, bench_ring_buffer_push_and_drain, bench_message_roundtrip);
criterion_main!(benches);
