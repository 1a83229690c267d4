use argh::FromArgs;
use std::sync::LazyLock;

fn msaa_samples(samples: &str) -> Result<Option<u32>, String> {
    let parsed: u32 = match samples.parse() {
        Ok(n) => n,
        Err(_) => return Ok(None),
    };

    if parsed.is_power_of_two() && parsed <= 8 {
        Ok(Some(parsed))
    } else {
        Ok(None)
    }
}

/// Engine arguments
#[derive(Default, FromArgs)]
pub struct EngineArgs {
    #[argh(switch, hidden_help)]
    pub no_vsync: bool,
    #[argh(switch, hidden_help)]
    pub no_raytracing: bool,
    #[argh(switch, hidden_help)]
    pub bindless: bool,

    #[argh(option, hidden_help)]
    pub fps_cap: Option<u32>,
    #[argh(option, hidden_help)]
    pub gamma: Option<f32>,

    #[argh(option, hidden_help, from_str_fn(msaa_samples))]
    pub msaa: Option<Option<u32>>,
}

impl EngineArgs {
    fn init() -> Option<EngineArgs> {
        let mut args = std::env::args();
        let cmd_name = args.next()?;
        let args: Vec<String> = args.collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        EngineArgs::from_args(&[&cmd_name], &args).ok()
    }

    pub fn get() -> &'static EngineArgs {
        static INSTANCE: LazyLock<EngineArgs> =
            LazyLock::new(|| EngineArgs::init().unwrap_or_default());
        &INSTANCE
    }

    pub fn msaa_override() -> Option<u32> {
        EngineArgs::get().msaa.flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msaa_parses_powers_of_two_only() {
        assert_eq!(msaa_samples("4"), Ok(Some(4)));
        assert_eq!(msaa_samples("8"), Ok(Some(8)));
        assert_eq!(msaa_samples("3"), Ok(None));
        assert_eq!(msaa_samples("16"), Ok(None));
        assert_eq!(msaa_samples("abc"), Ok(None));
    }
}
