use libtest_mimic::{Arguments, Trial};
use paste::paste;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use syclrt::{
    access::{AccessMode, AccessTarget},
    anyhow::format_err,
    buffer::Buffer,
    device::{Device, ExecutionMode},
    lock::{LockUnit, TileGrid},
    pipe::{error::PipeAlreadyUsed, Pipe},
    queue::Queue,
    result::Result,
};

fn main() {
    let args = Arguments::from_args();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let tests = [ExecutionMode::Synchronous, ExecutionMode::Asynchronous]
        .into_iter()
        .flat_map(|mode| tests(&Device::host().with_execution_mode(mode)))
        .chain(lock_tests())
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

fn device_test(
    device: &Device,
    name: &str,
    f: impl Fn(Device) -> Result<()> + Send + Sync + 'static,
) -> Trial {
    let name = format!(
        "{name}_{}",
        match device.execution_mode() {
            ExecutionMode::Synchronous => "sync",
            ExecutionMode::Asynchronous => "async",
        }
    );
    let device = device.clone();
    Trial::test(name, move || {
        f(device)?;
        Ok(())
    })
}

fn is_async(device: &Device) -> bool {
    device.execution_mode() == ExecutionMode::Asynchronous
}

fn tests(device: &Device) -> Vec<Trial> {
    let mut tests = vec![
        device_test(device, "readers_follow_writer", readers_follow_writer),
        device_test(device, "single_writer_at_a_time", single_writer_at_a_time),
        device_test(device, "host_waits_for_tasks", host_waits_for_tasks),
        device_test(device, "independent_buffers", independent_buffers),
        device_test(device, "kernel_error_releases", kernel_error_releases),
        device_test(device, "final_data_after_tasks", final_data_after_tasks),
        device_test(device, "hooks_around_kernel", hooks_around_kernel),
        device_test(device, "pipe_usage_conflict", pipe_usage_conflict),
    ];
    tests.push(
        device_test(device, "pipe_streaming_tasks", pipe_streaming_tasks)
            .with_ignored_flag(!is_async(device)),
    );
    macro_rules! pipe_fifo_tests {
        ($($T:ident),*) => {
            $(
                paste! {
                    tests.push(device_test(device, stringify!([<pipe_fifo_ $T:lower>]), pipe_fifo::<$T>));
                }
            )*
        };
    }
    pipe_fifo_tests!(u8, u32, f64);
    tests
}

fn lock_tests() -> Vec<Trial> {
    let mut tests = vec![Trial::test("lock_hand_over", || {
        lock_hand_over();
        Ok(())
    })];
    for k in [2, 3, 5] {
        tests.push(Trial::test(format!("horizontal_barrier_{k}"), move || {
            horizontal_barrier_line(k);
            Ok(())
        }));
    }
    tests
}

/// A writer, then two readers of the written data, then the host.
fn readers_follow_writer(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let buffer = Buffer::<u32>::new([4]);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    queue.submit(|h| {
        let x = h.require(&buffer, AccessMode::Write)?;
        let log = log.clone();
        h.single_task(move || {
            thread::sleep(Duration::from_millis(10));
            x.write()?.copy_from_slice(&[1, 2, 3, 4]);
            log.lock().push("writer");
            Ok(())
        })
    })?;
    let sums: Vec<_> = (0..2)
        .map(|_| Arc::new(AtomicUsize::new(0)))
        .collect();
    for sum in sums.iter() {
        queue.submit(|h| {
            let x = h.require(&buffer, AccessMode::Read)?;
            let log = log.clone();
            let sum = sum.clone();
            h.single_task(move || {
                log.lock().push("reader");
                let total: u32 = x.read().iter().sum();
                sum.store(total as usize, Ordering::SeqCst);
                Ok(())
            })
        })?;
    }
    let generation = buffer.tail_generation().unwrap();
    assert!(!generation.is_write_access());
    assert_eq!(buffer.host_read().as_slice(), &[1, 2, 3, 4]);
    assert!(generation.is_released());
    for sum in sums {
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }
    assert_eq!(log.lock().as_slice(), &["writer", "reader", "reader"]);
    Ok(())
}

fn single_writer_at_a_time(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let buffer = Buffer::from(vec![0u32]);
    let writers = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    for i in 0..8 {
        queue.submit(|h| {
            let mode = if i % 3 == 2 {
                AccessMode::Read
            } else {
                AccessMode::ReadWrite
            };
            let x = h.require(&buffer, mode)?;
            let writers = writers.clone();
            let overlaps = overlaps.clone();
            h.single_task(move || {
                if mode == AccessMode::Read {
                    return Ok(());
                }
                if writers.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                x.write()?[0] += 1;
                writers.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })?;
    }
    queue.wait()?;
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(buffer.to_vec(), [6]);
    Ok(())
}

fn host_waits_for_tasks(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let buffer = Buffer::<u64>::new([16]);
    let n = 5;
    for k in 0..n {
        queue.submit(|h| {
            let x = h.require(&buffer, AccessMode::ReadWrite)?;
            h.parallel_for(16, move |i| {
                x.write()?[i] += (k * 16 + i) as u64;
                Ok(())
            })
        })?;
    }
    let expected: Vec<u64> = (0..16u64)
        .map(|i| (0..n as u64).map(|k| k * 16 + i).sum())
        .collect();
    assert_eq!(buffer.to_vec(), expected);
    assert_eq!(queue.running(), 0);
    Ok(())
}

fn independent_buffers(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let a = Buffer::from(vec![1i32; 8]);
    let b = Buffer::from(vec![2i32; 8]);
    let c = Buffer::<i32>::new([8]);
    for buffer in [&a, &b] {
        queue.submit(|h| {
            let x = h.require(buffer, AccessMode::ReadWrite)?;
            h.single_task(move || {
                x.write()?.iter_mut().for_each(|x| *x *= 10);
                Ok(())
            })
        })?;
    }
    // Requires the buffers in the opposite order of their creation.
    queue.submit(|h| {
        let z = h.require(&c, AccessMode::DiscardWrite)?;
        let y = h.require(&b, AccessMode::Read)?;
        let x = h.require(&a, AccessMode::Read)?;
        h.parallel_for(8, move |i| {
            z.write()?[i] = x.read()[i] + y.read()[i];
            Ok(())
        })
    })?;
    queue.wait()?;
    assert_eq!(c.to_vec(), vec![30; 8]);
    Ok(())
}

fn kernel_error_releases(device: Device) -> Result<()> {
    let queue = Queue::new(device.clone());
    let buffer = Buffer::from(vec![0u8]);
    let submitted = queue.submit(|h| {
        h.require(&buffer, AccessMode::Write)?;
        h.single_task(|| Err(format_err!("kernel failed")))
    });
    let error = match submitted {
        Ok(event) => event.wait().unwrap_err(),
        Err(e) => {
            assert!(!is_async(&device));
            e
        }
    };
    assert_eq!(error.to_string(), "kernel failed");
    queue.submit(|h| {
        let x = h.require(&buffer, AccessMode::Write)?;
        h.single_task(move || {
            x.write()?[0] = 1;
            Ok(())
        })
    })?;
    assert_eq!(buffer.to_vec(), [1]);
    let queued = queue.wait();
    assert_eq!(queued.is_err(), is_async(&device));
    assert!(queue.wait().is_ok());
    Ok(())
}

fn final_data_after_tasks(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let final_data = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let buffer = Buffer::from(vec![0u32; 4]);
        buffer.set_final_data(Some(&final_data));
        queue.submit(|h| {
            let x = h.require(&buffer, AccessMode::Write)?;
            h.single_task(move || {
                thread::sleep(Duration::from_millis(10));
                x.write()?.fill(5);
                Ok(())
            })
        })?;
    }
    assert_eq!(final_data.lock().as_slice(), &[5; 4]);
    Ok(())
}

fn hooks_around_kernel(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let event = queue.submit(|h| {
        for (name, prelude) in [("prelude", true), ("postlude", false)] {
            let log = log.clone();
            let hook = move || log.lock().push(name);
            if prelude {
                h.prelude(hook)?;
            } else {
                h.postlude(hook)?;
            }
        }
        let log = log.clone();
        h.single_task(move || {
            log.lock().push("kernel");
            Ok(())
        })
    })?;
    event.wait()?;
    assert_eq!(log.lock().as_slice(), &["prelude", "kernel", "postlude"]);
    Ok(())
}

fn pipe_usage_conflict(_device: Device) -> Result<()> {
    let pipe = Pipe::<u8>::new(1);
    let writer = pipe.writer(AccessTarget::BlockingPipe)?;
    let e = pipe.writer(AccessTarget::Pipe).unwrap_err();
    assert!(e.downcast_ref::<PipeAlreadyUsed>().is_some());
    assert_eq!(e.to_string(), "The pipe is already used for writing!");
    drop(writer);
    pipe.writer(AccessTarget::Pipe)?;
    Ok(())
}

fn pipe_fifo<T>(_device: Device) -> Result<()>
where
    T: Clone + Default + Send + From<u8> + PartialEq + std::fmt::Debug,
{
    let pipe = Pipe::<T>::new(2);
    let writer = pipe.writer(AccessTarget::Pipe)?;
    let written: Vec<_> = (1..=3).map(|x| writer.write(T::from(x))).collect();
    assert_eq!(written, [true, true, false]);
    let reader = pipe.reader(AccessTarget::BlockingPipe)?;
    assert_eq!(reader.read(), Some(T::from(1)));
    assert_eq!(reader.read(), Some(T::from(2)));
    assert!(pipe.is_empty());
    Ok(())
}

fn pipe_streaming_tasks(device: Device) -> Result<()> {
    let queue = Queue::new(device);
    let pipe = Pipe::<u32>::new(4);
    let output = Buffer::<u32>::new([64]);
    let writer = pipe.writer(AccessTarget::BlockingPipe)?;
    let reader = pipe.reader(AccessTarget::BlockingPipe)?;
    queue.submit(|h| {
        let out = h.require(&output, AccessMode::DiscardWrite)?;
        h.single_task(move || {
            let mut out = out.write()?;
            for x in out.iter_mut() {
                *x = reader.read().ok_or_else(|| format_err!("pipe closed"))?;
            }
            Ok(())
        })
    })?;
    queue.submit(|h| {
        h.single_task(move || {
            for x in 0..64 {
                writer.write(x * x);
            }
            Ok(())
        })
    })?;
    queue.wait()?;
    assert_eq!(output.to_vec(), (0..64).map(|x| x * x).collect::<Vec<_>>());
    Ok(())
}

fn lock_hand_over() {
    let unit = LockUnit::new();
    let lock = unit.lock(0).unwrap();
    assert!(!lock.value());
    thread::scope(|s| {
        let waiter = s.spawn(|| lock.acquire_with_value(true));
        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        lock.release_with_value(true);
        waiter.join().unwrap();
    });
}

fn horizontal_barrier_line(k: usize) {
    let grid = TileGrid::new(k, 1);
    let arrived = AtomicUsize::new(0);
    thread::scope(|s| {
        for tile in grid.tiles() {
            let arrived = &arrived;
            s.spawn(move || {
                arrived.fetch_add(1, Ordering::SeqCst);
                tile.horizontal_barrier();
                assert_eq!(arrived.load(Ordering::SeqCst), k);
            });
        }
    });
}
