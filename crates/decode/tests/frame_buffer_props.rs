use proptest::prelude::*;

use grabme_common::clock::FrameTimebase;
use grabme_decode::{FrameAccounting, FrameBuffer, RgbaImage};

#[derive(Debug, Clone)]
enum Op {
    Add(u64),
    Consume(u64),
    EvictBefore(u64),
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u64..40).prop_map(Op::Add),
        3 => (0u64..40).prop_map(Op::Consume),
        1 => (0u64..40).prop_map(Op::EvictBefore),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn prop_size_bounded_and_every_frame_released_once(
        capacity in 1usize..8,
        ops in proptest::collection::vec(op(), 1..120),
    ) {
        let timebase = FrameTimebase::new(25.0);
        let accounting = FrameAccounting::new();
        let buffer = FrameBuffer::new(capacity, timebase);
        let mut held = Vec::new();

        for op in ops {
            match op {
                Op::Add(index) => {
                    let image = RgbaImage::filled(1, 1, [0, 0, 0, 255]).unwrap();
                    let frame = accounting.frame(
                        timebase.index_to_us(index),
                        timebase.frame_duration_us(),
                        image,
                    );
                    buffer.add_frame(frame).unwrap();
                }
                Op::Consume(index) => {
                    if let Some(frame) = buffer.consume_frame(index) {
                        held.push(frame);
                    }
                }
                Op::EvictBefore(index) => {
                    buffer.evict_before(timebase.index_to_us(index));
                }
                Op::Reset => buffer.reset(),
            }
            prop_assert!(buffer.len() <= capacity);
            prop_assert_eq!(
                accounting.outstanding(),
                (buffer.len() + held.len()) as u64
            );
        }

        drop(held);
        buffer.destroy();
        prop_assert_eq!(accounting.outstanding(), 0);
        prop_assert_eq!(accounting.released(), accounting.allocated());
    }
}
