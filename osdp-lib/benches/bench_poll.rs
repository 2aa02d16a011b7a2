use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use osdp_lib::{
    CommandOutcome, ControlPanel, MemoryChannel, OsdpCommand, OsdpCommandOutput, PdInfo,
    PeripheralDevice,
};

fn online_pair() -> (ControlPanel, PeripheralDevice) {
    let (cp_end, pd_end) = MemoryChannel::pair();
    let cp_info = PdInfo::new(1, 115200, Arc::new(cp_end));
    let pd_info = PdInfo::new(1, 115200, Arc::new(pd_end));
    let mut cp = ControlPanel::setup(vec![cp_info], None).expect("cp setup");
    let mut pd = PeripheralDevice::setup(pd_info, Some([0x42; 16])).expect("pd setup");
    pd.set_command_callback(|_, _| CommandOutcome::Accepted);

    for _ in 0..1000 {
        cp.refresh();
        pd.refresh();
        if cp.status_mask() == 1 {
            return (cp, pd);
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("PD never came online");
}

/// One application command from enqueue to consumed ACK, including frame
/// build, CRC and both decodes.
fn bench_command_cycle(c: &mut Criterion) {
    let (mut cp, mut pd) = online_pair();
    c.bench_function("output_command_round_trip", |b| {
        b.iter(|| {
            cp.send_command(
                0,
                OsdpCommand::Output(OsdpCommandOutput {
                    output_no: 0,
                    control_code: 1,
                    timer_count: 0,
                }),
            )
            .expect("queue");
            cp.refresh(); // transmit
            pd.refresh(); // decode + reply
            cp.refresh(); // consume the ACK
        })
    });
}

criterion_group!(benches, bench_command_cycle);
criterion_main!(benches);
