use gchan_emu::{Config, Emu};
use gchan_utils::setup_tracing;
use std::time::Instant;

/// Small guest program: counts r3 up to 100 in a loop, then spins at an
/// idle branch the runner hooks to stop.
pub fn write_test_program(emu: &mut Emu) {
    const BASE: u32 = 0x8000_0000;
    let addi = |rd: u32, ra: u32, simm: i16| {
        (14 << 26) | (rd << 21) | (ra << 16) | (simm as u16 as u32)
    };
    let cmpwi = |ra: u32, simm: i16| (11 << 26) | (ra << 16) | (simm as u16 as u32);
    // bc 4, 2, -8 : branch back while CR0.EQ is clear
    let bne_back = |offset: i32| (16 << 26) | (4 << 21) | (2 << 16) | ((offset as u32) & 0xFFFC);
    let b_self = 18 << 26;

    emu.write_program(
        BASE,
        &[
            addi(3, 0, 0),
            addi(3, 3, 1),
            cmpwi(3, 100),
            bne_back(-8),
            b_self,
        ],
    );
    emu.install_stop_hook(BASE + 16);
    emu.ppc.pc = BASE;
}

pub fn time<F, T>(f: F) -> (T, f64)
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let res = f();
    (res, start.elapsed().as_secs_f64() * 1000.0)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    setup_tracing();

    let mut emu = Emu::new(Config::default())?;
    write_test_program(&mut emu);

    let (_, runtime_ms) = time(|| emu.run());
    tracing::info!(
        r3 = emu.ppc.gpr[3],
        pc = %gchan_utils::hex(emu.ppc.pc),
        runtime_ms,
        "guest program finished"
    );
    Ok(())
}
