//! `qtd [settings.json]`
//!
//! Runs measurement batches and prints one telemetry line per batch on
//! stdout. Logs go to stderr.
use std::cell::RefCell;
use std::path::Path;
use std::process::ExitCode;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use log::LevelFilter;
use qtd::batch::BatchRunner;
use qtd::settings::Settings;
use qtd::telemetry::TelemetryClient;
use qtd::{logger, Error};
use tdc7201::sim::SimChip;
use tdc7201::{Histogram, Monotonic, RegisterBus, Stimulus, Tdc7201};

fn acquire<B, I, O, C>(
    tdc: &mut Tdc7201<B, I, O, C>,
    settings: &Settings,
) -> Result<Histogram, Error>
where
    B: RegisterBus,
    I: InputPin,
    O: OutputPin,
    C: Monotonic + DelayNs,
{
    tdc.set_retry(settings.retry());
    tdc.set_clock_speed(settings.spi_speed, settings.force_speed)?;
    tdc.on()?;
    tdc.configure(&settings.tdc)?;
    tdc.clear_status(true)?;
    tdc.read_regs8()?;
    tdc.dump();

    let stimulus = settings.simulate.then(|| {
        let stimulus = Stimulus::new(settings.seed);
        match settings.stop_density {
            Some(density) => stimulus.with_density(density),
            None => stimulus,
        }
    });
    let mut runner = BatchRunner::new(settings.batch_size, stimulus);
    let mut telemetry =
        TelemetryClient::new(std::io::stdout(), settings.prefix.clone());
    let mut total = Histogram::default();
    let mut batch = 0;
    while settings.batches == 0 || batch < settings.batches {
        let report = runner.run(tdc)?;
        telemetry.publish_telemetry("/batch", &report);
        total.merge(&report.histogram);
        batch += 1;
    }
    Ok(total)
}

fn run(settings: &Settings) -> Result<(), Error> {
    if let Some(device) = &settings.device {
        return Err(Error::BusUnavailable(device.clone()));
    }
    let frequency = settings.tdc.reference_frequency() as u32;
    let chip = RefCell::new(SimChip::new(frequency));
    let mut tdc = SimChip::driver(&chip)?;
    let result = acquire(&mut tdc, settings);
    // Power down even if acquisition failed.
    let cleanup = tdc.cleanup();
    let total = result?;
    cleanup?;
    log::info!(
        "{} measurements, {} errors, counts {:?}",
        total.total(),
        total.errors(),
        total.counts
    );
    Ok(())
}

fn main() -> ExitCode {
    let settings = match std::env::args_os().nth(1) {
        Some(path) => Settings::load(Path::new(&path)),
        None => Ok(Settings::default()),
    };
    let level = settings
        .as_ref()
        .map(|s| s.log_level.into())
        .unwrap_or(LevelFilter::Info);
    if logger::init(level).is_err() {
        eprintln!("{}", Error::Logger);
    }

    match settings.and_then(|settings| run(&settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
