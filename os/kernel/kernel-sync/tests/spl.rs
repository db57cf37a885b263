use kernel_sync::{InterruptPriority, Spl, SplGuard};
use std::cell::Cell;

#[derive(Default)]
struct Cpu {
    level: Cell<Spl>,
    writes: Cell<usize>,
}

impl InterruptPriority for Cpu {
    fn spl(&self) -> Spl {
        self.level.get()
    }

    fn set_spl(&self, level: Spl) -> Spl {
        self.writes.set(self.writes.get() + 1);
        self.level.replace(level)
    }
}

#[test]
fn guard_raises_and_restores() {
    let cpu = Cpu::default();
    {
        let g = SplGuard::raise(&cpu, Spl::Vm);
        assert_eq!(cpu.spl(), Spl::Vm);
        assert_eq!(g.previous(), Spl::Zero);
    }
    assert_eq!(cpu.spl(), Spl::Zero);
}

#[test]
fn raise_never_lowers() {
    let cpu = Cpu::default();
    cpu.set_spl(Spl::High);
    {
        let _g = SplGuard::raise(&cpu, Spl::Vm);
        assert_eq!(cpu.spl(), Spl::High);
    }
    assert_eq!(cpu.spl(), Spl::High);
}

#[test]
fn nested_guards_unwind_in_order() {
    let cpu = Cpu::default();
    let outer = SplGuard::raise(&cpu, Spl::Soft);
    {
        let _inner = SplGuard::raise(&cpu, Spl::Vm);
        assert_eq!(cpu.spl(), Spl::Vm);
    }
    assert_eq!(cpu.spl(), Spl::Soft);
    drop(outer);
    assert_eq!(cpu.spl(), Spl::Zero);
}

#[test]
fn levels_are_ordered_and_named() {
    assert!(Spl::Zero < Spl::Soft && Spl::Soft < Spl::Vm && Spl::Vm < Spl::High);
    assert_eq!(Spl::Vm.to_string(), "splvm");
}
