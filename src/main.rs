#![allow(mixed_script_confusables)]

use std::env;

use log::error;

use crate::demonstration::DemonstrationConfiguration;

mod core;
mod demonstration;

fn main() {
    env_logger::init();
    let args = env::args().collect::<Vec<_>>();

    let instructions = "pass `--select`, `--dropout [seed] [ratio]`, `--activation`, or `--gradient-check`";

    if args.len() <= 1 {
        println!("{}", instructions);
        return;
    }

    let mut configuration = DemonstrationConfiguration::default();
    let outcome = match args[1].as_str() {
        "--select" => demonstration::demonstrate_selection(&configuration).map(|(y, gx)| {
            println!("selected: {}", y);
            println!("input gradient: {}", gx);
        }),
        "--dropout" => {
            if let Some(seed) = args.get(2) {
                match seed.parse() {
                    Ok(seed) => configuration.seed = seed,
                    Err(_) => {
                        println!("seed should be a nonnegative integer, got {:?}", seed);
                        return;
                    }
                }
            }
            if let Some(ratio) = args.get(3) {
                match ratio.parse() {
                    Ok(ratio) => configuration.ratio = ratio,
                    Err(_) => {
                        println!("ratio should be a number, got {:?}", ratio);
                        return;
                    }
                }
            }
            demonstration::demonstrate_dropout(&configuration).map(|run| {
                println!("output: {}", run.output);
                println!("mask: {}", run.mask);
                println!("input gradient: {}", run.input_gradient);
            })
        }
        "--activation" => demonstration::demonstrate_activation(&configuration),
        "--gradient-check" => demonstration::demonstrate_gradient_check(&configuration)
            .map(|()| println!("all gradients agree")),
        _ => {
            println!("{}", instructions);
            return;
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        println!("{}", e);
        std::process::exit(1);
    }
}
