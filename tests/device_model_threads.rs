//! vCPU threads blocking on the device model running in another thread.

use hvio_core::{
    emulate_io_post, pio_instr_vmexit_handler, wait_for_io_completion, DeviceModelNotifier, Gpr,
    GuestFlags, IoAccess, IoExitInfo, PostOutcome, Vcpu, Vm, VmConfig, VmExitAction,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const VCPUS: u16 = 4;
const ROUNDS: u32 = 50;

#[derive(Default)]
struct Upcalls(AtomicUsize);

impl DeviceModelNotifier for Upcalls {
    fn request_pending(&self, _vm_id: u16, _vcpu_id: u16) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A device model whose port 0x510 reads back `port + vcpu_id`.
fn spawn_device_model(vm: Arc<Vm>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<u32> {
    std::thread::spawn(move || {
        let channel = vm.channel();
        let mut served = 0;
        while !stop.load(Ordering::SeqCst) {
            for vcpu_id in channel.wait_for_pending(Some(Duration::from_millis(20))) {
                let access = channel.take(vcpu_id).unwrap();
                let value = match access {
                    IoAccess::Pio(pio) => u64::from(pio.address) + u64::from(vcpu_id),
                    other => panic!("unexpected request {other:?}"),
                };
                channel.complete(vcpu_id, value).unwrap();
                served += 1;
            }
        }
        served
    })
}

fn run(config: VmConfig) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    let upcalls = Arc::new(Upcalls::default());
    let mut vm = Vm::new(config);
    vm.set_device_model_notifier(upcalls.clone());
    vm.launch();
    let vm = Arc::new(vm);

    let stop = Arc::new(AtomicBool::new(false));
    let dm = spawn_device_model(vm.clone(), stop.clone());

    let vcpus: Vec<_> = (0..VCPUS)
        .map(|id| {
            let vm = vm.clone();
            std::thread::spawn(move || {
                let mut vcpu = Vcpu::new(id);
                for _ in 0..ROUNDS {
                    let exit = IoExitInfo::new(0x510, 2, true, 1);
                    let action = pio_instr_vmexit_handler(&vm, &mut vcpu, exit).unwrap();
                    assert_eq!(action, VmExitAction::Suspend);

                    wait_for_io_completion(&vm, &vcpu).unwrap();
                    assert_eq!(emulate_io_post(&vm, &mut vcpu), Ok(PostOutcome::Applied));
                    assert_eq!(vcpu.regs.get(Gpr::Rax) & 0xFFFF, 0x510 + u64::from(id));
                }
                vcpu.regs.rip
            })
        })
        .collect();

    for handle in vcpus {
        assert_eq!(handle.join().unwrap(), u64::from(ROUNDS));
    }
    stop.store(true, Ordering::SeqCst);
    let served = dm.join().unwrap();

    assert_eq!(served, u32::from(VCPUS) * ROUNDS);
    assert_eq!(upcalls.0.load(Ordering::SeqCst), served as usize);
}

#[test]
fn sleeping_vcpus_are_woken_by_completion() {
    run(VmConfig {
        vm_id: 3,
        vcpu_num: VCPUS,
        ..VmConfig::default()
    });
}

#[test]
fn polling_vcpus_observe_completion() {
    run(VmConfig {
        vm_id: 4,
        vcpu_num: VCPUS,
        guest_flags: GuestFlags::IO_COMPLETION_POLLING,
        ..VmConfig::default()
    });
}
