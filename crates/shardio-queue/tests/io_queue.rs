//! End-to-end tests driving the admission queue, sink and intents together.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, Instant};

use rand::Rng;
use shardio_queue::{
    AdmitOptions, CapacityGroup, CapacityGroupConfig, ClassId, Intent, IoCompletion, IoHandle,
    IoQueue, IoQueueConfig, IoRequest, IoSink, IoVec, QueueError, RefState, SafeRef,
};

/// A fake device of `N` i32 slots; a write at position `idx` stores one value.
struct FakeFile<const N: usize> {
    data: RefCell<[i32; N]>,
}

impl<const N: usize> FakeFile<N> {
    fn new() -> Self {
        Self {
            data: RefCell::new([0; N]),
        }
    }

    fn make_write_req(idx: u64, buf: &i32) -> IoRequest {
        let bytes = unsafe {
            std::slice::from_raw_parts(buf as *const i32 as *const u8, std::mem::size_of::<i32>())
        };
        // SAFETY: callers keep the boxed value alive until the request is drained
        unsafe { IoRequest::make_write(0, idx, IoVec::from_slice(bytes), false) }
    }

    fn execute_write_req(&self, req: &IoRequest, completion: IoCompletion) {
        let bytes = unsafe { req.iovecs()[0].as_slice() };
        let value = i32::from_ne_bytes(bytes.try_into().unwrap());
        self.data.borrow_mut()[req.pos() as usize] = value;
        completion.complete_with(req.size());
    }

    fn get(&self, idx: usize) -> i32 {
        self.data.borrow()[idx]
    }
}

struct QueueForTests {
    group: Arc<CapacityGroup>,
    sink: Rc<IoSink>,
    queue: IoQueue,
    epoch: Instant,
}

impl QueueForTests {
    fn new() -> Self {
        let epoch = Instant::now();
        let group = Arc::new(
            CapacityGroup::with_epoch(
                CapacityGroupConfig {
                    initial_tokens: 0,
                    ..Default::default()
                },
                epoch,
            )
            .unwrap(),
        );
        let sink = Rc::new(IoSink::new());
        let queue = IoQueue::new(IoQueueConfig::default(), Arc::clone(&group), Rc::clone(&sink))
            .unwrap();
        Self {
            group,
            sink,
            queue,
            epoch,
        }
    }

    /// Advances simulated time by `ms` and runs a scheduling pass.
    fn kick(&mut self, ms: u64) -> usize {
        self.epoch += Duration::from_millis(ms);
        self.queue.tick(self.epoch)
    }

    fn admit(&mut self, class: ClassId, req: IoRequest, intent: Option<&Intent>) -> IoHandle {
        self.queue
            .admit(class, req, intent, AdmitOptions::default())
            .unwrap()
    }
}

#[tokio::test]
async fn test_basic_flow() {
    let mut tio = QueueForTests::new();
    let file = FakeFile::<1>::new();
    let class = tio.group.register_priority_class("default", 1).unwrap();

    let val = Box::new(42i32);
    let handle = tio.admit(class, FakeFile::<1>::make_write_req(0, &val), None);

    assert_eq!(tio.kick(500), 1);
    tio.sink.drain(|req, completion| {
        file.execute_write_req(req, completion);
        true
    });

    assert_eq!(handle.await.unwrap(), 4);
    assert_eq!(file.get(0), 42);
}

#[test]
fn test_split_flat_request() {
    let mut buf = [0u8; 33];
    let req = unsafe { IoRequest::make_read(9, 42, IoVec::from_mut_slice(&mut buf), false) };
    let base = buf.as_ptr() as usize;

    let parts: Vec<(u64, usize, usize)> = req
        .split(13)
        .iter()
        .map(|p| (p.req.pos(), p.size, p.req.address().unwrap() as usize - base))
        .collect();
    assert_eq!(parts, vec![(42, 13, 0), (55, 13, 13), (68, 7, 26)]);
}

#[test]
fn test_intent_safe_ref() {
    let get_cancelled = |r: &SafeRef| matches!(r.retrieve(), Err(QueueError::Cancelled));

    let intent = Intent::new();
    let intent_x = Intent::new();

    let mut ref_orig = SafeRef::new(&intent);
    assert_eq!(ref_orig.retrieve().unwrap(), Some(intent.id()));

    // move armed
    let mut ref_armed = ref_orig.take();
    assert_eq!(ref_orig.retrieve().unwrap(), None);
    assert_eq!(ref_armed.retrieve().unwrap(), Some(intent.id()));

    let mut ref_armed_2 = SafeRef::new(&intent_x);
    assert_eq!(ref_armed_2.state(), RefState::Armed);
    ref_armed_2 = ref_armed.take();
    assert_eq!(ref_armed.retrieve().unwrap(), None);
    assert_eq!(ref_armed_2.retrieve().unwrap(), Some(intent.id()));

    intent.cancel();
    assert!(get_cancelled(&ref_armed_2));

    // move cancelled
    let mut ref_cancelled = ref_armed_2.take();
    assert_eq!(ref_armed_2.retrieve().unwrap(), None);
    assert!(get_cancelled(&ref_cancelled));

    let mut ref_cancelled_2 = SafeRef::new(&intent_x);
    assert_eq!(ref_cancelled_2.state(), RefState::Armed);
    ref_cancelled_2 = ref_cancelled.take();
    assert_eq!(ref_cancelled.retrieve().unwrap(), None);
    assert!(get_cancelled(&ref_cancelled_2));

    // move empty
    let mut ref_empty = ref_orig.take();
    assert_eq!(ref_empty.retrieve().unwrap(), None);

    let mut ref_empty_2 = SafeRef::new(&intent_x);
    assert_eq!(ref_empty_2.state(), RefState::Armed);
    ref_empty_2 = ref_empty.take();
    assert_eq!(ref_empty_2.retrieve().unwrap(), None);

    assert_eq!(intent_x.registered(), 0);
}

const NR_REQUESTS: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Tag {
    Live,
    Dead,
    Legacy,
}

#[tokio::test]
async fn test_io_cancellation() {
    let file = FakeFile::<NR_REQUESTS>::new();
    let mut tio = QueueForTests::new();
    let pc0 = tio.group.register_priority_class("a", 100).unwrap();
    let pc1 = tio.group.register_priority_class("b", 100).unwrap();

    let live = Intent::new();
    let dead = Intent::new();

    let mut rng = rand::thread_rng();
    let mut buffers: Vec<Box<i32>> = Vec::with_capacity(NR_REQUESTS);
    let mut finished = Vec::new();
    let mut cancelled = Vec::new();

    for idx in 0..NR_REQUESTS {
        let val = 100 + idx as i32;
        buffers.push(Box::new(val));
        let req = FakeFile::<NR_REQUESTS>::make_write_req(idx as u64, &buffers[idx]);
        let pc = if rng.gen_range(0..2) == 0 { pc0 } else { pc1 };

        // guarantee at least one request of each kind
        let tag = match idx {
            0 => Tag::Live,
            1 => Tag::Dead,
            2 => Tag::Legacy,
            _ => match rng.gen_range(0..6) {
                0..=2 => Tag::Live,
                3 | 4 => Tag::Dead,
                _ => Tag::Legacy,
            },
        };

        match tag {
            Tag::Live => finished.push((idx, val, tio.admit(pc, req, Some(&live)))),
            Tag::Dead => cancelled.push((idx, tio.admit(pc, req, Some(&dead)))),
            Tag::Legacy => finished.push((idx, val, tio.admit(pc, req, None))),
        }
    }

    dead.cancel();

    // cancelled requests must resolve right at once
    for (idx, handle) in cancelled.iter_mut() {
        let result = handle.await;
        assert!(matches!(result, Err(QueueError::Cancelled)), "request {} not cancelled", idx);
    }

    while !tio.queue.is_empty() {
        tio.kick(500);
        tio.sink.drain(|req, completion| {
            file.execute_write_req(req, completion);
            true
        });
    }

    for (idx, _) in &cancelled {
        assert_eq!(file.get(*idx), 0);
    }
    for (idx, val, handle) in finished {
        assert_eq!(handle.await.unwrap(), 4);
        assert_eq!(file.get(idx), val);
    }

    let stats = tio.queue.stats();
    assert_eq!(stats.cancelled as usize, cancelled.len());
    assert_eq!(stats.dispatched as usize, NR_REQUESTS - cancelled.len());
}

#[tokio::test]
async fn test_vectored_request_split_through_queue() {
    let mut tio = QueueForTests::new();
    let class = tio.group.register_priority_class("bulk", 1).unwrap();
    let config = IoQueueConfig {
        max_read_len: 13,
        ..Default::default()
    };
    tio.queue = IoQueue::new(config, Arc::clone(&tio.group), Rc::clone(&tio.sink)).unwrap();

    let mut a = vec![0u8; 10];
    let mut b = vec![0u8; 20];
    let req = unsafe {
        IoRequest::make_readv(
            3,
            1000,
            vec![IoVec::from_mut_slice(&mut a), IoVec::from_mut_slice(&mut b)],
            true,
        )
    };
    let handle = tio.admit(class, req, None);
    assert_eq!(handle.parts(), 3);

    tio.kick(500);
    let mut positions = Vec::new();
    tio.sink.drain(|req, completion| {
        positions.push((req.pos(), req.size()));
        for iov in req.iovecs() {
            unsafe { iov.as_mut_slice() }.fill(req.pos() as u8);
        }
        completion.complete_with(req.size());
        true
    });

    assert_eq!(positions, vec![(1000, 13), (1013, 13), (1026, 4)]);
    assert_eq!(handle.await.unwrap(), 30);
    assert!(a.iter().all(|&x| x == 1000u64 as u8));
    assert_eq!(&b[..3], &[1000u64 as u8; 3]);
    assert_eq!(&b[3..16], &[1013u64 as u8; 13]);
    assert_eq!(&b[16..], &[1026u64 as u8; 4]);
}

#[tokio::test]
async fn test_partial_cancel_of_split_request_waits_for_dispatched_parts() {
    let group = Arc::new(
        CapacityGroup::new(CapacityGroupConfig {
            initial_tokens: 1,
            max_tokens: 1,
            per_interval_increment: 0,
            ..Default::default()
        })
        .unwrap(),
    );
    let class = group.register_priority_class("bulk", 1).unwrap();
    let sink = Rc::new(IoSink::new());
    let config = IoQueueConfig {
        max_write_len: 4,
        ..Default::default()
    };
    let mut queue = IoQueue::new(config, group, Rc::clone(&sink)).unwrap();

    let intent = Intent::new();
    let buf = [7u8; 8];
    let req = unsafe { IoRequest::make_write(0, 0, IoVec::from_slice(&buf), false) };
    let mut handle = queue
        .admit(class, req, Some(&intent), AdmitOptions::default())
        .unwrap();
    assert_eq!(handle.parts(), 2);

    // only one token: first part dispatched, second stays queued
    assert_eq!(queue.poll(), 1);
    intent.cancel();

    let mut claimed = Vec::new();
    sink.drain(|_, completion| {
        claimed.push(completion);
        true
    });
    assert_eq!(claimed.len(), 1);

    // the dispatched part still owns the buffer, so the handle must wait
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());

    claimed.pop().unwrap().complete_with(4);
    assert!(matches!(handle.await, Err(QueueError::Cancelled)));
    assert_eq!(queue.stats().dispatched, 1);
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[tokio::test]
async fn test_two_queues_share_one_group() {
    let epoch = Instant::now();
    let group = Arc::new(
        CapacityGroup::with_epoch(
            CapacityGroupConfig {
                initial_tokens: 3,
                max_tokens: 3,
                per_interval_increment: 0,
                ..Default::default()
            },
            epoch,
        )
        .unwrap(),
    );
    let class = group.register_priority_class("shared", 1).unwrap();
    let sink_a = Rc::new(IoSink::new());
    let sink_b = Rc::new(IoSink::new());
    let mut qa =
        IoQueue::new(IoQueueConfig::default(), Arc::clone(&group), Rc::clone(&sink_a)).unwrap();
    let mut qb =
        IoQueue::new(IoQueueConfig::default(), Arc::clone(&group), Rc::clone(&sink_b)).unwrap();
    assert_eq!(group.members(), 2);

    let buf = [0u8; 1];
    let mut handles: Vec<IoHandle> = Vec::new();
    for pos in 0..4 {
        let a = unsafe { IoRequest::make_write(0, pos, IoVec::from_slice(&buf), false) };
        let b = unsafe { IoRequest::make_write(1, pos, IoVec::from_slice(&buf), false) };
        handles.push(qa.admit(class, a, None, AdmitOptions::default()).unwrap());
        handles.push(qb.admit(class, b, None, AdmitOptions::default()).unwrap());
    }

    let total = qa.poll() + qb.poll();
    assert_eq!(total, 3);
    assert_eq!(sink_a.len() + sink_b.len(), 3);
    assert_eq!(group.available(), 0);

    drop(qb);
    assert_eq!(group.members(), 1);
}
