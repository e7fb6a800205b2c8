//! Building a VM from JSON configuration plus board tables.

use anyhow::{ensure, Context, Result};
use hvio_board::{create_prelaunched_vm_e820, BoardInfo, E820Type};
use hvio_core::{
    emulate_io, emulate_pio_post, Gpr, GuestFlags, IoAccess, LoadOrder, PioIndex, PioRange, Vcpu,
    Vm, VmConfig,
};
use serde_json::json;

const BOARD: &str = r#"{
    "name": "test-board",
    "cpu_state": {
        "model_name": "Test CPU",
        "cx_data": [
            { "cx_reg": { "space_id": 127, "bit_width": 1, "bit_offset": 2, "access_size": 1 }, "type": 1, "latency": 1, "power": 0 },
            { "cx_reg": { "space_id": 1, "bit_width": 8, "address": 1045 }, "type": 2, "latency": 50, "power": 0 }
        ]
    },
    "sstate": {
        "pm1a_evt": { "space_id": 1, "bit_width": 32, "address": 1024 },
        "pm1a_cnt": { "space_id": 1, "bit_width": 16, "address": 1028 }
    }
}"#;

/// Wires a pre-launched VM the way board bring-up does: PM1 blocks are emulated, C-state entry
/// ports reach hardware.
fn build_vm(config: VmConfig, board: &BoardInfo) -> Result<Vm> {
    let mut vm = Vm::new(config);
    for port in board.cpu_state.io_cx_ports() {
        vm.allow_guest_pio_access(port, 1);
    }
    let evt = PioRange::try_from(&board.sstate.pm1a_evt).context("PM1a event block")?;
    vm.register_pio_emulation_handler(
        PioIndex::Pm1aEvt,
        evt,
        Box::new(|_, _| Ok(0)),
        Box::new(|_, _, _| Ok(())),
    )?;
    let cnt = PioRange::try_from(&board.sstate.pm1a_cnt).context("PM1a control block")?;
    vm.register_pio_emulation_handler(
        PioIndex::Pm1aCnt,
        cnt,
        // SCI_EN always reads back set.
        Box::new(|_, _| Ok(0x0001)),
        Box::new(|_, _, _| Ok(())),
    )?;
    vm.launch();
    Ok(vm)
}

#[test]
fn pre_launched_vm_from_json() -> Result<()> {
    let config = VmConfig::from_json(
        &json!({
            "vm_id": 0,
            "name": "safety-vm",
            "load_order": "pre_launched",
            "vcpu_num": 2,
            "guest_flags": "IO_COMPLETION_POLLING",
            "mem_size": 0x2000_0000u64
        })
        .to_string(),
    )?;
    ensure!(config.load_order == LoadOrder::PreLaunched);
    ensure!(config.guest_flags.contains(GuestFlags::IO_COMPLETION_POLLING));

    let board = BoardInfo::from_json(BOARD)?;
    let e820 = create_prelaunched_vm_e820(config.mem_size)?;
    let ram: u64 = e820
        .iter()
        .filter(|e| e.kind == E820Type::Ram)
        .map(|e| e.length)
        .sum();
    ensure!(ram == config.mem_size - 0x1_0000, "RAM in e820: {ram:#x}");

    let vm = build_vm(config, &board)?;
    ensure!(vm.is_pio_passthrough(0x415, 1));
    ensure!(!vm.is_pio_passthrough(0x404, 2));

    let mut vcpu = Vcpu::new(1);
    vcpu.set_io_request(IoAccess::pio_read(0x404, 2))?;
    emulate_io(&vm, &mut vcpu)?;
    emulate_pio_post(&mut vcpu)?;
    ensure!(vcpu.regs.get(Gpr::Rax) == 0x0001);
    Ok(())
}

#[test]
fn config_round_trips_through_json() -> Result<()> {
    let config = VmConfig {
        vm_id: 5,
        name: "post".into(),
        load_order: LoadOrder::PostLaunched,
        vcpu_num: 3,
        guest_flags: GuestFlags::IO_COMPLETION_POLLING | GuestFlags::RT,
        completion_timeout_ms: 250,
        mem_size: 0x4000_0000,
    };
    let text = serde_json::to_string(&config)?;
    ensure!(VmConfig::from_json(&text)? == config);
    Ok(())
}
