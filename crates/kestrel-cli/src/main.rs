use anyhow::Result;
use clap::{Parser, ValueEnum};
use kestrel_sim::{
    generate, generate_sensor_data, params_json, run_filter_returning_ekf, HarnessConfig,
    Scenario, SensorConfig,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(about = "Navigation-filter batch runner: simulate, sense, filter, export")]
#[command(version)]
struct Args {
    /// Output directory
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,

    /// Flight profile
    #[arg(long, value_enum, default_value = "static-pad")]
    scenario: ScenarioArg,

    /// Simulated duration (s)
    #[arg(long, default_value_t = 30.0)]
    duration: f32,

    /// IMU interval (s)
    #[arg(long, default_value_t = 0.01)]
    imu_dt: f32,

    // ── Scenario parameters ───────────────────────────────────
    #[arg(long, default_value_t = 0.1)]
    yaw_rate: f32,

    #[arg(long, default_value_t = 2.0)]
    accel: f32,

    #[arg(long, default_value_t = 10.0)]
    cruise_speed: f32,

    // ── Sensor options ────────────────────────────────────────
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 1.0)]
    noise_scale: f32,

    /// GNSS dropout window: start and end seconds
    #[arg(long, num_args = 2)]
    gps_outage: Option<Vec<f32>>,

    /// Ground depth below the NED origin for the terrain sensors (m)
    #[arg(long, default_value_t = 50.0)]
    terrain_depth: f32,

    #[arg(long)]
    use_airspeed: bool,

    #[arg(long)]
    use_range_finder: bool,

    #[arg(long)]
    use_optical_flow: bool,

    /// Declare the vehicle airborne after this many seconds
    #[arg(long)]
    airborne_after: Option<f32>,

    // ── Filter tuning overrides ───────────────────────────────
    #[arg(long)]
    vne_sigma: Option<f32>,

    #[arg(long)]
    pos_ne_sigma: Option<f32>,

    #[arg(long)]
    pos_d_sigma: Option<f32>,

    #[arg(long)]
    mag_sigma: Option<f32>,

    #[arg(long)]
    gyro_process_noise: Option<f32>,

    #[arg(long)]
    accel_process_noise: Option<f32>,

    /// Skip the CSV export
    #[arg(long)]
    no_csv: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioArg {
    StaticPad,
    YawRotation,
    CruiseLeg,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("Kestrel navigation filter runner");
    println!("================================\n");

    let scenario = match args.scenario {
        ScenarioArg::StaticPad => Scenario::StaticPad,
        ScenarioArg::YawRotation => Scenario::YawRotation {
            rate: args.yaw_rate,
        },
        ScenarioArg::CruiseLeg => Scenario::CruiseLeg {
            accel: args.accel,
            cruise_speed: args.cruise_speed,
        },
    };

    // 1. Truth
    let truth = generate(scenario, args.duration, args.imu_dt);

    // 2. Sensors
    let sensor_cfg = build_sensor_config(&args);
    let data = generate_sensor_data(&truth, &sensor_cfg);

    // 3. Filter
    let harness_cfg = build_harness_config(&args);
    println!("Tuning: {}", params_json(&harness_cfg.params));
    let (result, ekf) = run_filter_returning_ekf(&data, &harness_cfg);

    // 4. Summary
    print_summary(&truth, &result, &ekf);

    // 5. Export
    if !args.no_csv {
        write_output(&args, &truth, &result)?;
    }

    Ok(())
}

fn build_sensor_config(args: &Args) -> SensorConfig {
    SensorConfig {
        noise_scale: args.noise_scale,
        seed: args.seed,
        gps_outage: args
            .gps_outage
            .as_ref()
            .map(|w| (w[0], w[1])),
        terrain_d: args.terrain_depth,
        tas_hz: if args.use_airspeed { 2.0 } else { 0.0 },
        rng_hz: if args.use_range_finder { 10.0 } else { 0.0 },
        flow_hz: if args.use_optical_flow { 10.0 } else { 0.0 },
        ..Default::default()
    }
}

fn build_harness_config(args: &Args) -> HarnessConfig {
    let mut cfg = HarnessConfig {
        airborne_after: args.airborne_after,
        ..Default::default()
    };
    cfg.switches.use_airspeed = args.use_airspeed;
    cfg.switches.use_range_finder = args.use_range_finder;
    cfg.switches.use_optical_flow = args.use_optical_flow;
    if let Some(v) = args.vne_sigma {
        cfg.params.vne_sigma = v;
    }
    if let Some(v) = args.pos_ne_sigma {
        cfg.params.pos_ne_sigma = v;
    }
    if let Some(v) = args.pos_d_sigma {
        cfg.params.pos_d_sigma = v;
    }
    if let Some(v) = args.mag_sigma {
        cfg.params.mag_measurement_sigma = v;
    }
    if let Some(v) = args.gyro_process_noise {
        cfg.params.gyro_process_noise = v;
    }
    if let Some(v) = args.accel_process_noise {
        cfg.params.accel_process_noise = v;
    }
    cfg
}

fn print_summary(
    truth: &kestrel_sim::Truth,
    result: &kestrel_sim::FilterResult,
    ekf: &kestrel_core::NavEkf,
) {
    // Result row i corresponds to truth row i + 1 (IMU records start one tick in)
    let n = result.pos.len().min(truth.pos.len().saturating_sub(1));
    let mut pos_err_sq = 0.0f64;
    let mut vel_err_sq = 0.0f64;
    for i in 0..n {
        pos_err_sq += (result.pos[i] - truth.pos[i + 1]).norm_squared() as f64;
        vel_err_sq += (result.vel[i] - truth.vel[i + 1]).norm_squared() as f64;
    }
    let pos_rmse = (pos_err_sq / n.max(1) as f64).sqrt();
    let vel_rmse = (vel_err_sq / n.max(1) as f64).sqrt();

    let report = &result.final_report;
    println!("\nRun summary:");
    println!("  Ticks:          {}", result.time.len());
    println!("  Pos RMSE:       {:.3} m", pos_rmse);
    println!("  Vel RMSE:       {:.3} m/s", vel_rmse);
    println!(
        "  GNSS/baro:      {} fused / {} rejected / {} resets",
        result.velpos.fused, result.velpos.rejected, result.velpos.resets
    );
    println!(
        "  Magnetometer:   {} fused / {} rejected / {} resets",
        result.mag.fused, result.mag.rejected, result.mag.resets
    );
    if result.tas.fused + result.tas.rejected > 0 {
        println!(
            "  Airspeed:       {} fused / {} rejected",
            result.tas.fused, result.tas.rejected
        );
    }
    if result.rng.fused + result.rng.rejected > 0 {
        println!(
            "  Range finder:   {} fused / {} rejected",
            result.rng.fused, result.rng.rejected
        );
    }
    if result.flow.fused + result.flow.rejected > 0 {
        println!(
            "  Optical flow:   {} fused / {} rejected",
            result.flow.fused, result.flow.rejected
        );
    }
    println!("  Health errors:  {}", result.health_errors);
    println!(
        "  Channel health: vel={} pos={} hgt={} mag={}",
        report.vel.healthy, report.pos.healthy, report.hgt.healthy, report.mag.healthy
    );
    let eul = ekf.euler();
    println!(
        "  Final attitude: roll {:.3} pitch {:.3} yaw {:.3} rad",
        eul.x, eul.y, eul.z
    );
    println!("-----------------------------");
}

fn write_output(
    args: &Args,
    truth: &kestrel_sim::Truth,
    result: &kestrel_sim::FilterResult,
) -> Result<()> {
    std::fs::create_dir_all(&args.output_dir)?;
    let path = args.output_dir.join("run.csv");
    let mut wtr = csv::Writer::from_path(&path)?;

    wtr.write_record([
        "time",
        "true_pos_n",
        "true_pos_e",
        "true_pos_d",
        "true_vel_n",
        "true_vel_e",
        "true_vel_d",
        "est_pos_n",
        "est_pos_e",
        "est_pos_d",
        "est_vel_n",
        "est_vel_e",
        "est_vel_d",
        "est_roll",
        "est_pitch",
        "est_yaw",
    ])?;

    let n = result.time.len().min(truth.pos.len().saturating_sub(1));
    for i in 0..n {
        let tp = truth.pos[i + 1];
        let tv = truth.vel[i + 1];
        let ep = result.pos[i];
        let ev = result.vel[i];
        let ee = result.euler[i];
        wtr.write_record(&[
            format!("{:.4}", result.time[i]),
            format!("{:.4}", tp.x),
            format!("{:.4}", tp.y),
            format!("{:.4}", tp.z),
            format!("{:.4}", tv.x),
            format!("{:.4}", tv.y),
            format!("{:.4}", tv.z),
            format!("{:.4}", ep.x),
            format!("{:.4}", ep.y),
            format!("{:.4}", ep.z),
            format!("{:.4}", ev.x),
            format!("{:.4}", ev.y),
            format!("{:.4}", ev.z),
            format!("{:.4}", ee.x),
            format!("{:.4}", ee.y),
            format!("{:.4}", ee.z),
        ])?;
    }

    wtr.flush()?;
    println!("Data written to {:?}", path);
    Ok(())
}
