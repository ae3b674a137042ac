//! Register name and value parsing for `register view` and
//! `register write`. Names cover the GPR bank (x/w), the vector bank
//! (q/d/s), and the special registers; values are typed by the register's
//! width.

use crate::error::{DbgError, DbgResult};
use crate::kernel::KernelInterface;
use crate::thread::MachThread;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegType {
    /// 64-bit.
    Long,
    /// 32-bit.
    Integer,
    Float,
    Double,
    /// 128-bit vector register.
    Quadword,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RegId {
    X(usize),
    W(usize),
    Fp,
    Lr,
    Sp,
    Pc,
    Cpsr,
    Fpsr,
    Fpcr,
    S(usize),
    D(usize),
    Q(usize),
}

fn parse_reg(name: &str) -> DbgResult<(RegId, RegType, String)> {
    let cleaned = name.trim().trim_start_matches('$').to_lowercase();

    let unknown = || DbgError::UnknownRegister(name.trim().to_string());

    let (id, rtype) = match cleaned.as_str() {
        "fp" => (RegId::Fp, RegType::Long),
        "lr" => (RegId::Lr, RegType::Long),
        "sp" => (RegId::Sp, RegType::Long),
        "pc" => (RegId::Pc, RegType::Long),
        "cpsr" => (RegId::Cpsr, RegType::Integer),
        "fpsr" => (RegId::Fpsr, RegType::Integer),
        "fpcr" => (RegId::Fpcr, RegType::Integer),
        _ => {
            if cleaned.len() < 2 {
                return Err(unknown());
            }
            let (prefix, digits) = cleaned.split_at(1);
            let n: usize = digits.parse().map_err(|_| unknown())?;
            match prefix {
                "x" if n <= 28 => (RegId::X(n), RegType::Long),
                "w" if n <= 28 => (RegId::W(n), RegType::Integer),
                "s" if n <= 31 => (RegId::S(n), RegType::Float),
                "d" if n <= 31 => (RegId::D(n), RegType::Double),
                "q" if n <= 31 => (RegId::Q(n), RegType::Quadword),
                _ => return Err(unknown()),
            }
        }
    };

    Ok((id, rtype, cleaned))
}

/// Format one register from the thread's cached state, in the style used
/// when `register view` is given explicit names.
pub fn format_register(t: &MachThread, name: &str) -> DbgResult<String> {
    let (id, _, cleaned) = parse_reg(name)?;

    let out = match id {
        RegId::X(n) => format!("{:>8} = 0x{:016x}", cleaned, t.thread_state.x[n]),
        RegId::W(n) => format!("{:>8} = 0x{:08x}", cleaned, t.thread_state.x[n] as u32),
        RegId::Fp => format!("{:>8} = 0x{:016x}", cleaned, t.thread_state.fp),
        RegId::Lr => format!("{:>8} = 0x{:016x}", cleaned, t.thread_state.lr),
        RegId::Sp => format!("{:>8} = 0x{:016x}", cleaned, t.thread_state.sp),
        RegId::Pc => format!("{:>8} = 0x{:016x}", cleaned, t.thread_state.pc),
        RegId::Cpsr => format!("{:>8} = 0x{:08x}", cleaned, t.thread_state.cpsr),
        RegId::Fpsr => format!("{:>8} = 0x{:08x}", cleaned, t.neon_state.fpsr),
        RegId::Fpcr => format!("{:>8} = 0x{:08x}", cleaned, t.neon_state.fpcr),
        RegId::S(n) => format!(
            "{:>8} = {}",
            cleaned,
            f32::from_bits(t.neon_state.q[n] as u32)
        ),
        RegId::D(n) => format!(
            "{:>8} = {}",
            cleaned,
            f64::from_bits(t.neon_state.q[n] as u64)
        ),
        RegId::Q(n) => format!("{:>8} = 0x{:032x}", cleaned, t.neon_state.q[n]),
    };

    Ok(out)
}

fn parse_u64(value: &str) -> DbgResult<u64> {
    let v = value.trim();
    let malformed = || DbgError::MalformedLiteral(v.to_string());

    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| malformed())
    } else if v.starts_with('-') {
        v.parse::<i64>().map(|n| n as u64).map_err(|_| malformed())
    } else {
        v.parse::<u64>().map_err(|_| malformed())
    }
}

fn parse_u32(value: &str) -> DbgResult<u32> {
    let wide = parse_u64(value)?;

    // Accept anything representable in 32 bits, signed or unsigned.
    let as_signed = wide as i64;
    if wide <= u32::max_value() as u64
        || (as_signed < 0 && as_signed >= i32::min_value() as i64)
    {
        Ok(wide as u32)
    } else {
        Err(DbgError::WidthOverflow {
            value: value.trim().to_string(),
            width: 32,
        })
    }
}

fn parse_u128(value: &str) -> DbgResult<u128> {
    let v = value.trim();
    let malformed = || DbgError::MalformedLiteral(v.to_string());

    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u128::from_str_radix(hex, 16).map_err(|_| malformed())
    } else {
        v.parse::<u128>().map_err(|_| malformed())
    }
}

fn parse_f32_bits(value: &str) -> DbgResult<u32> {
    let v = value.trim();
    if v.starts_with("0x") || v.starts_with("0X") {
        parse_u32(v)
    } else {
        v.parse::<f32>()
            .map(f32::to_bits)
            .map_err(|_| DbgError::MalformedLiteral(v.to_string()))
    }
}

fn parse_f64_bits(value: &str) -> DbgResult<u64> {
    let v = value.trim();
    if v.starts_with("0x") || v.starts_with("0X") {
        parse_u64(v)
    } else {
        v.parse::<f64>()
            .map(f64::to_bits)
            .map_err(|_| DbgError::MalformedLiteral(v.to_string()))
    }
}

/// Parse `value` at the register's width and write it through the cache to
/// the kernel.
pub fn write_register(
    t: &mut MachThread,
    kernel: &dyn KernelInterface,
    name: &str,
    value: &str,
) -> DbgResult<()> {
    let (id, rtype, _) = parse_reg(name)?;

    let kernel_err = |err| DbgError::Kernel {
        op: "thread-state apply",
        err,
    };

    match rtype {
        RegType::Long | RegType::Integer => {
            t.get_thread_state(kernel).map_err(kernel_err)?;
            match id {
                RegId::X(n) => t.thread_state.x[n] = parse_u64(value)?,
                RegId::W(n) => t.thread_state.x[n] = parse_u32(value)? as u64,
                RegId::Fp => t.thread_state.fp = parse_u64(value)?,
                RegId::Lr => t.thread_state.lr = parse_u64(value)?,
                RegId::Sp => t.thread_state.sp = parse_u64(value)?,
                RegId::Pc => t.thread_state.pc = parse_u64(value)?,
                RegId::Cpsr => t.thread_state.cpsr = parse_u32(value)?,
                RegId::Fpsr => {
                    t.get_neon_state(kernel).map_err(kernel_err)?;
                    t.neon_state.fpsr = parse_u32(value)?;
                    return t.set_neon_state(kernel).map_err(kernel_err);
                }
                RegId::Fpcr => {
                    t.get_neon_state(kernel).map_err(kernel_err)?;
                    t.neon_state.fpcr = parse_u32(value)?;
                    return t.set_neon_state(kernel).map_err(kernel_err);
                }
                _ => unreachable!(),
            }
            t.set_thread_state(kernel).map_err(kernel_err)
        }
        RegType::Float | RegType::Double | RegType::Quadword => {
            t.get_neon_state(kernel).map_err(kernel_err)?;
            match id {
                RegId::S(n) => t.neon_state.q[n] = parse_f32_bits(value)? as u128,
                RegId::D(n) => t.neon_state.q[n] = parse_f64_bits(value)? as u128,
                RegId::Q(n) => t.neon_state.q[n] = parse_u128(value)?,
                _ => unreachable!(),
            }
            t.set_neon_state(kernel).map_err(kernel_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::kernel::mock::MockKernel;
    use crate::kernel::ThreadIdent;

    fn thread_with_kernel() -> (Arc<MockKernel>, MachThread) {
        let kernel = Arc::new(MockKernel::new());
        kernel.add_thread(0x70b, 0x1, "main");
        let t = MachThread::new(0x70b, 1, ThreadIdent {
            tid: 0x1,
            name: "main".to_string(),
        });
        (kernel, t)
    }

    #[test]
    fn unknown_registers_are_rejected() {
        let (_kernel, t) = thread_with_kernel();
        assert!(matches!(
            format_register(&t, "x29"),
            Err(DbgError::UnknownRegister(_))
        ));
        assert!(matches!(
            format_register(&t, "y3"),
            Err(DbgError::UnknownRegister(_))
        ));
        assert!(matches!(
            format_register(&t, "q32"),
            Err(DbgError::UnknownRegister(_))
        ));
    }

    #[test]
    fn formats_match_the_register_width() {
        let (_kernel, mut t) = thread_with_kernel();
        t.thread_state.x[5] = 0xdead_beef_0000_1111;
        t.thread_state.cpsr = 0x6000_0000;
        t.neon_state.q[2] = 0x4048_f5c3; // 3.14f

        assert_eq!(
            format_register(&t, "$X5").unwrap(),
            "      x5 = 0xdeadbeef00001111"
        );
        assert_eq!(
            format_register(&t, "w5").unwrap(),
            "      w5 = 0x00001111"
        );
        assert_eq!(
            format_register(&t, "cpsr").unwrap(),
            "    cpsr = 0x60000000"
        );
        assert_eq!(format_register(&t, "s2").unwrap(), "      s2 = 3.14");
    }

    #[test]
    fn writes_round_trip_through_the_kernel() {
        let (kernel, mut t) = thread_with_kernel();

        write_register(&mut t, kernel.as_ref(), "x3", "0xabc").unwrap();
        assert_eq!(kernel.get_thread_state(0x70b).unwrap().x[3], 0xabc);

        write_register(&mut t, kernel.as_ref(), "pc", "4096").unwrap();
        assert_eq!(kernel.get_thread_state(0x70b).unwrap().pc, 4096);

        write_register(&mut t, kernel.as_ref(), "w4", "-16").unwrap();
        assert_eq!(
            kernel.get_thread_state(0x70b).unwrap().x[4],
            0xffff_fff0
        );

        write_register(&mut t, kernel.as_ref(), "d1", "2.5").unwrap();
        assert_eq!(
            kernel.get_neon_state(0x70b).unwrap().q[1],
            2.5f64.to_bits() as u128
        );

        write_register(&mut t, kernel.as_ref(), "q0", "0xffeeddccbbaa99887766554433221100")
            .unwrap();
        assert_eq!(
            kernel.get_neon_state(0x70b).unwrap().q[0],
            0xffee_ddcc_bbaa_9988_7766_5544_3322_1100
        );
    }

    #[test]
    fn malformed_and_oversized_literals() {
        let (kernel, mut t) = thread_with_kernel();

        assert!(matches!(
            write_register(&mut t, kernel.as_ref(), "x0", "zzz"),
            Err(DbgError::MalformedLiteral(_))
        ));
        assert!(matches!(
            write_register(&mut t, kernel.as_ref(), "w0", "0x100000000"),
            Err(DbgError::WidthOverflow { width: 32, .. })
        ));
        assert!(matches!(
            write_register(&mut t, kernel.as_ref(), "s0", "not-a-float"),
            Err(DbgError::MalformedLiteral(_))
        ));
    }
}
