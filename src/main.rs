use std::process;

use emarm::screen::{Monitor, NullScreen, Screen};
use emarm::{Configuration, Emulator, Fatal};

struct Args {
    image: String,
    config: Configuration,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let help_msg = "\
USAGE:
    mypi [OPTIONS] <IMAGE>

ARGS:
    <IMAGE>    Raw kernel image, loaded verbatim into SDRAM at the start
               address.

OPTIONS:
    --help            Print this message.
    --quiet           Suppress info/error messages and the final dump.
    --graphics        Emulate the framebuffer in a host window.
    --nes             Route the keyboard to the NES controller model.
    --memory=SIZE     SDRAM size in bytes; k/K and m/M suffixes accepted.
                        (default: 64k, which is also the minimum)
    --addr=N          Kernel start address. (default: 0)
    --gpio-test=N     Drive GPIO ports N..N+8 from the host keys 1-9.

KEYMAP (--nes):
    A=Space  B=Tab  START=Return  SELECT=P
    UP=W  DOWN=S  LEFT=A  RIGHT=D";

    let mut image = None;
    let mut config = Configuration::default();

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("quiet") => config.quiet = true,
            Long("graphics") => config.graphics = true,
            Long("nes") => config.nes_enabled = true,
            Long("memory") => config.mem_size = parse_size(&parser.value()?.string()?)?,
            Long("addr") => config.start_addr = parser.value()?.parse()?,
            Long("gpio-test") => config.gpio_test_offset = Some(parser.value()?.parse()?),
            Long("help") => {
                println!("{}", help_msg);
                process::exit(0);
            }
            Value(path) if image.is_none() => image = Some(path.string()?),
            _ => return Err(arg.unexpected()),
        }
    }

    if config.mem_size < 0x10000 {
        return Err("Must specify a minimum of 64kb of memory".into());
    }

    Ok(Args { image: image.ok_or("No kernel image specified")?, config })
}

fn parse_size(arg: &str) -> Result<usize, lexopt::Error> {
    let (digits, scale) = match arg.chars().last() {
        Some('k') | Some('K') => (&arg[..arg.len() - 1], 1024),
        Some('m') | Some('M') => (&arg[..arg.len() - 1], 1024 * 1024),
        _ => (arg, 1),
    };
    match digits.parse::<usize>() {
        Ok(size) => Ok(size * scale),
        Err(_) => Err("invalid value for option '--memory'".into()),
    }
}

fn run(args: Args) -> Result<(), Fatal> {
    let quiet = args.config.quiet;
    let screen: Box<dyn Screen> = if args.config.graphics {
        Box::new(Monitor::new())
    } else {
        Box::new(NullScreen)
    };

    let mut emu = Emulator::with_screen(args.config, screen);
    emu.load(&args.image)?;
    emu.run()?;

    if !quiet {
        emu.dump()?;
    }
    Ok(())
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!("Refer to --help for more information");
            process::exit(1);
        }
    };

    // In case of a fatal emulation error, code will end up here.
    if let Err(fatal) = run(args) {
        eprintln!("ERROR: {}", fatal);
        process::exit(1);
    }
}
