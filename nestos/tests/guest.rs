mod common;

use bedrock::{
    dev::{console::Console, keyboard::KeyEvent},
    x86::segmentation::Segment,
};
use common::{Machine, GREETING, GUEST_GREETING, GUEST_TEXT};
use nestos::{
    hv::{hypercall::HvOp, GUEST_CRASH_STATUS, GUEST_INTERRUPT_KMODE, HV_MAGIC},
    syscall::{FORK_INT, GETTID_INT, WAIT_INT},
    thread::Pid,
};

const GUEST_STACK: u32 = 0x1_0000;
const TIMER_HANDLER: u32 = 0x1100;
const KEYBOARD_HANDLER: u32 = 0x1200;
const SC_H: u8 = 0x23;

struct Hosted {
    m: Machine,
    parent: Pid,
    guest: Pid,
}

impl Hosted {
    /// init forks a child that becomes the guest kernel.
    fn launch() -> Self {
        let mut m = Machine::boot();
        let parent = m.current();
        let guest = m.call(FORK_INT, 0).unwrap() as Pid;
        m.tick_until(guest);
        assert_eq!(m.exec("guest", &["guest"]), Some(HV_MAGIC));
        m.frame.esp = GUEST_STACK;
        Self { m, parent, guest }
    }

    fn hv(&mut self, op: HvOp, args: &[u32]) -> Option<u32> {
        self.m
            .kernel
            .hypercall(&mut self.m.frame, op as u32, args)
            .expect("arguments reach the guest stack")
    }

    fn host_addr(&self, guest_addr: u32) -> u32 {
        self.m.kernel.mm.layout.user_mem_start + guest_addr
    }

    fn guest_word(&mut self, guest_addr: u32) -> u32 {
        let at = self.host_addr(guest_addr);
        self.m.read_u32(at)
    }

    fn interrupts_enabled(&self) -> bool {
        self.m
            .kernel
            .blocks
            .pcb(self.guest)
            .and_then(|pcb| pcb.guest.as_ref())
            .map_or(false, |g| g.interrupt_enable)
    }

    /// Collect the guest from its parent and return its status.
    fn reap(&mut self) -> i32 {
        assert_ne!(self.m.current(), self.guest);
        self.m.tick_until(self.parent);
        let status_ptr = self.m.scratch() - 0x100;
        assert_eq!(self.m.call(WAIT_INT, status_ptr), Some(self.guest as u32));
        self.m.read_u32(status_ptr) as i32
    }
}

#[test]
fn guest_starts_in_guest_kernel_mode() {
    let mut h = Hosted::launch();
    let f = h.m.frame;
    assert_eq!(f.cs, Segment::GuestKernelCode.into_selector());
    assert_eq!(f.ds, Segment::GuestKernelData.into_selector());
    assert_eq!(f.eip, GUEST_TEXT);
    let size = h.m.kernel.mm.layout.guest_mem_size;
    assert_eq!(f.ecx, size - 1);
    assert_eq!(f.ebx, size / 0x1000 - 1);

    assert_eq!(h.hv(HvOp::Magic, &[]), Some(HV_MAGIC));
    let at = h.host_addr(GUEST_GREETING);
    assert_eq!(h.m.read(at, GREETING.len()), GREETING);
    // Hypercall arguments are popped on return.
    assert_eq!(h.m.frame.esp, GUEST_STACK);
}

#[test]
fn guest_prints_through_the_host_console() {
    let mut h = Hosted::launch();
    let len = GREETING.len() as u32;
    assert!(h.hv(HvOp::Print, &[len, GUEST_GREETING]).is_some());
    assert!(h.m.row(0).starts_with("hello from guest"));

    let before = h.m.console.0.lock().cursor();
    assert!(h
        .hv(HvOp::PrintAt, &[len, GUEST_GREETING, 5, 10, 0x1f])
        .is_some());
    assert_eq!(&h.m.row(5)[10..10 + GREETING.len()], "hello from guest");
    assert_eq!(h.m.console.0.lock().cursor(), before);

    assert!(h.hv(HvOp::SetCursor, &[2, 3]).is_some());
    assert!(h.hv(HvOp::GetCursor, &[0x5000, 0x5004]).is_some());
    assert_eq!(h.guest_word(0x5000), 2);
    assert_eq!(h.guest_word(0x5004), 3);
}

#[test]
fn timer_is_delivered_when_the_guest_runs_again() {
    let mut h = Hosted::launch();
    assert!(h.hv(HvOp::SetIdt, &[32, TIMER_HANDLER, 1]).is_some());
    assert!(h.hv(HvOp::EnableInterrupts, &[]).is_some());
    let eflags = h.m.frame.eflags;

    // The tick takes the cpu away; the guest sees it when it comes back.
    h.m.tick();
    assert_ne!(h.m.current(), h.guest);
    h.m.tick_until(h.guest);
    assert_eq!(h.m.frame.eip, TIMER_HANDLER);
    assert_eq!(h.m.frame.cs, Segment::GuestKernelCode.into_selector());
    assert!(!h.interrupts_enabled());

    let esp = h.m.frame.esp;
    assert_eq!(esp, GUEST_STACK - 20);
    assert_eq!(h.guest_word(esp), 0);
    assert_eq!(h.guest_word(esp + 4), 0);
    assert_eq!(h.guest_word(esp + 8), GUEST_TEXT);
    assert_eq!(h.guest_word(esp + 12), GUEST_INTERRUPT_KMODE);
    assert_eq!(h.guest_word(esp + 16), eflags);

    assert_eq!(
        h.hv(HvOp::Iret, &[GUEST_TEXT, eflags, GUEST_STACK, 0, 9]),
        Some(9)
    );
    assert_eq!(h.m.frame.eip, GUEST_TEXT);
    assert_eq!(h.m.frame.esp, GUEST_STACK);
    assert!(h.interrupts_enabled());
}

#[test]
fn disabled_delivery_drops_the_timer() {
    let mut h = Hosted::launch();
    assert!(h.hv(HvOp::SetIdt, &[32, TIMER_HANDLER, 1]).is_some());
    h.m.tick();
    h.m.tick_until(h.guest);
    assert_eq!(h.m.frame.eip, GUEST_TEXT);
}

#[test]
fn keystrokes_reach_the_guest_decoded() {
    let mut h = Hosted::launch();
    assert!(h.hv(HvOp::SetIdt, &[33, KEYBOARD_HANDLER, 1]).is_some());
    assert!(h.hv(HvOp::EnableInterrupts, &[]).is_some());

    h.m.press(SC_H);
    assert_eq!(h.m.current(), h.guest);
    assert_eq!(h.m.frame.eip, KEYBOARD_HANDLER);
    let esp = h.m.frame.esp;
    let event = KeyEvent(h.guest_word(esp + 4));
    assert!(event.has_data() && event.is_make());
    assert_eq!(event.char(), b'h');
}

#[test]
fn guest_exit_reports_its_status() {
    let mut h = Hosted::launch();
    assert_eq!(h.hv(HvOp::Exit, &[5]), None);
    assert_eq!(h.reap(), 5);
}

fn assert_crashes(h: &mut Hosted) {
    assert_ne!(h.m.current(), h.guest);
    assert_eq!(h.m.status_of(h.guest), Some(GUEST_CRASH_STATUS));
    assert_eq!(h.reap(), GUEST_CRASH_STATUS);
}

#[test]
fn overlong_print_crashes_only_the_guest() {
    let mut h = Hosted::launch();
    assert_eq!(h.hv(HvOp::Print, &[300, GUEST_GREETING]), None);
    assert_crashes(&mut h);
}

#[test]
fn pointer_outside_guest_memory_crashes() {
    let mut h = Hosted::launch();
    let size = h.m.kernel.mm.layout.guest_mem_size;
    assert_eq!(h.hv(HvOp::Print, &[4, size - 2]), None);
    assert_crashes(&mut h);
}

#[test]
fn unknown_and_unsupported_hypercalls_crash() {
    let mut h = Hosted::launch();
    assert_eq!(
        h.m.kernel.hypercall(&mut h.m.frame, 99, &[]),
        Ok(None)
    );
    assert_crashes(&mut h);

    let mut h = Hosted::launch();
    assert_eq!(h.hv(HvOp::SetPd, &[0]), None);
    assert_crashes(&mut h);
}

#[test]
fn bad_virtual_idt_entry_crashes() {
    let mut h = Hosted::launch();
    assert_eq!(h.hv(HvOp::SetIdt, &[40, TIMER_HANDLER, 1]), None);
    assert_crashes(&mut h);
}

#[test]
fn host_system_calls_are_not_for_guests() {
    let mut h = Hosted::launch();
    assert_eq!(h.m.call(GETTID_INT, 0), None);
    assert_crashes(&mut h);
}

#[test]
fn unhandled_guest_fault_crashes() {
    let mut h = Hosted::launch();
    let beyond = h.host_addr(h.m.kernel.mm.layout.guest_mem_size);
    assert!(h.m.kernel.user_read_u32(&mut h.m.frame, beyond).is_err());
    assert_crashes(&mut h);
}

#[test]
fn guest_fault_is_delivered_with_its_address() {
    let mut h = Hosted::launch();
    assert!(h.hv(HvOp::SetIdt, &[14, TIMER_HANDLER, 1]).is_some());
    assert!(h.hv(HvOp::EnableInterrupts, &[]).is_some());
    let beyond = h.m.kernel.mm.layout.guest_mem_size;
    let at = h.host_addr(beyond);
    assert!(h.m.kernel.user_read_u32(&mut h.m.frame, at).is_err());
    assert_eq!(h.m.current(), h.guest);
    assert_eq!(h.m.frame.eip, TIMER_HANDLER);
    let esp = h.m.frame.esp;
    assert_eq!(h.guest_word(esp), beyond);
}
