/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Berkus Decker <berkus+vesper@metta.systems>
 */

use {
    anyhow::{anyhow, Context, Result},
    clap::{value_parser, Arg, ArgMatches, Command},
    colored::*,
    libiommu::{
        fault::{FaultStatus, GlobalFaultStatus},
        regs::{ContextRegister, SCTLR},
        TableFormat,
    },
    prettytable::{row, Table},
};

// smmu-decode fsr 0x40000002
// smmu-decode ttbr 0x0003000880000000 --format 64
fn main() -> Result<()> {
    let value_arg = || {
        Arg::new("value")
            .required(true)
            .help("Register value, hex with 0x prefix or decimal")
    };
    let matches = Command::new("smmu-decode - SMMU register decoder")
        .about("Decode SMMU context bank register values from fault dumps")
        .disable_version_flag(true)
        .subcommand_required(true)
        .subcommand(Command::new("fsr").about("Context fault status").arg(value_arg()))
        .subcommand(Command::new("gfsr").about("Global fault status").arg(value_arg()))
        .subcommand(Command::new("sctlr").about("Context system control").arg(value_arg()))
        .subcommand(
            Command::new("ttbr")
                .about("Translation table base with ASID")
                .arg(value_arg())
                .arg(
                    Arg::new("format")
                        .long("format")
                        .help("Page table format, 32 or 64")
                        .value_parser(value_parser!(u32))
                        .default_value("32"),
                ),
        )
        .subcommand(Command::new("regs").about("Context bank register layout"))
        .get_matches();

    match matches.subcommand() {
        Some(("fsr", sub)) => {
            let fsr = FaultStatus::from_bits_retain(value(sub)?);
            print_flags("FSR", fsr.bits(), fsr.iter_names().map(|(name, _)| name));
        }
        Some(("gfsr", sub)) => {
            let gfsr = GlobalFaultStatus::from_bits_retain(value(sub)?);
            print_flags("GFSR", gfsr.bits(), gfsr.iter_names().map(|(name, _)| name));
        }
        Some(("sctlr", sub)) => print_sctlr(value(sub)?),
        Some(("ttbr", sub)) => {
            let format = match sub.get_one::<u32>("format") {
                Some(32) | None => TableFormat::Format32,
                Some(64) => TableFormat::Format64,
                Some(other) => return Err(anyhow!("unknown page table format {}", other)),
            };
            print_ttbr(value(sub)?, format);
        }
        Some(("regs", _)) => print_layout(),
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}

fn value<T: TryFrom<u64>>(matches: &ArgMatches) -> Result<T> {
    let text = matches
        .get_one::<String>("value")
        .ok_or_else(|| anyhow!("value must be specified"))?;
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => text.replace('_', "").parse::<u64>(),
    }
    .with_context(|| format!("cannot parse {}", text))?;
    T::try_from(parsed).map_err(|_| anyhow!("{:#x} does not fit the register", parsed))
}

fn print_flags<'a>(register: &str, bits: u32, names: impl Iterator<Item = &'a str>) {
    println!("{} = {}", register.bold(), format!("{:08x}", bits).cyan());
    let mut table = Table::new();
    table.set_titles(row!["Flag", "Set"]);
    let mut any = false;
    for name in names {
        table.add_row(row![name.red(), "yes"]);
        any = true;
    }
    if any {
        table.printstd();
    } else {
        println!("{}", "no fault bits set".green());
    }
}

fn print_sctlr(value: u32) {
    let bit = |on: u32| {
        if on != 0 {
            "on".green()
        } else {
            "off".dimmed()
        }
    };
    println!("{} = {}", "SCTLR".bold(), format!("{:08x}", value).cyan());
    let mut table = Table::new();
    table.set_titles(row!["Field", "Value", "Meaning"]);
    table.add_row(row!["M", bit(SCTLR::M.read(value)), "translation enable"]);
    table.add_row(row!["TRE", bit(SCTLR::TRE.read(value)), "TEX remap"]);
    table.add_row(row!["AFE", bit(SCTLR::AFE.read(value)), "access flag"]);
    table.add_row(row!["AFFD", bit(SCTLR::AFFD.read(value)), "access flag fault disable"]);
    table.add_row(row!["E", bit(SCTLR::E.read(value)), "big-endian walks"]);
    table.add_row(row!["CFRE", bit(SCTLR::CFRE.read(value)), "fault reporting"]);
    table.add_row(row!["CFIE", bit(SCTLR::CFIE.read(value)), "fault interrupt"]);
    let cfcfg = if SCTLR::CFCFG.read(value) != 0 {
        "stall"
    } else {
        "terminate"
    };
    table.add_row(row!["CFCFG", cfcfg, "on fault"]);
    table.add_row(row!["HUPCF", bit(SCTLR::HUPCF.read(value)), "hit under fault"]);
    table.add_row(row!["ASIDPNE", bit(SCTLR::ASIDPNE.read(value)), "private ASIDs"]);
    table.printstd();
}

fn print_ttbr(value: u64, format: TableFormat) {
    const ADDRESS_MASK: u64 = (1 << 48) - 1;
    println!(
        "{} = {} ({})",
        "TTBR".bold(),
        format!("{:016x}", value).cyan(),
        format
    );
    let mut table = Table::new();
    table.set_titles(row!["Field", "Value"]);
    table.add_row(row!["ASID", (value >> 48) & 0xff]);
    table.add_row(row!["Table base", format!("{:#x}", value & ADDRESS_MASK)]);
    table.add_row(row!["Input bits", format.ias()]);
    table.add_row(row!["Output bits", format.oas()]);
    table.printstd();
}

fn print_layout() {
    let mut table = Table::new();
    table.set_titles(row!["Register", "Offset", "Width"]);
    for reg in ContextRegister::ALL {
        let width = if reg.is_64bit() { 64 } else { 32 };
        table.add_row(row![reg.name(), format!("{:#05x}", reg.offset()), width]);
    }
    table.printstd();
}
