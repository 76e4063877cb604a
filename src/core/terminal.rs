use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");
pub static ANVIL: Emoji<'_, '_> = Emoji("⚒️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "  __                       ",
        " / _| ___  _ __ __ _  ___  ",
        "| |_ / _ \\| '__/ _` |/ _ \\ ",
        "|  _| (_) | | | (_| |  __/ ",
        "|_|  \\___/|_|  \\__, |\\___| ",
        "               |___/       ",
    ];

    // Gradient: ember → amber → steel (diagonal top-left → bottom-right)
    let stops: [(u8, u8, u8); 3] = [(239, 68, 68), (245, 158, 11), (148, 163, 184)];
    let max_w = 27u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;245;158;11mInstructions, tempered overnight.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

pub fn print_goodbye() {
    println!(
        "\n{} {}",
        SPARKLE,
        style("Forge cooled down. See you next time!").bold().cyan()
    );
}

enum GuideLine {
    Command(String, String),
    Status(String, String),
    Info(String),
    Text(String),
    Hint(String),
    Blank,
}

/// A titled block of terminal output, built up fluently and printed once.
pub struct GuideSection {
    title: String,
    lines: Vec<GuideLine>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, desc: &str) -> Self {
        self.lines
            .push(GuideLine::Command(name.to_string(), desc.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(GuideLine::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn info(mut self, msg: &str) -> Self {
        self.lines.push(GuideLine::Info(msg.to_string()));
        self
    }

    pub fn text(mut self, msg: &str) -> Self {
        self.lines.push(GuideLine::Text(msg.to_string()));
        self
    }

    pub fn hint(mut self, msg: &str) -> Self {
        self.lines.push(GuideLine::Hint(msg.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(GuideLine::Blank);
        self
    }

    fn command_width(&self) -> usize {
        self.lines
            .iter()
            .filter_map(|l| match l {
                GuideLine::Command(name, _) => Some(name.chars().count()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn print(self) {
        let width = self.command_width();
        println!("\n{} {}", ANVIL, style(&self.title).bold().underlined());
        for line in &self.lines {
            match line {
                GuideLine::Command(name, desc) => println!(
                    "  {:<width$}  {}",
                    style(name).cyan().bold(),
                    style(desc).dim(),
                    width = width
                ),
                GuideLine::Status(label, value) => print_status(label, value),
                GuideLine::Info(msg) => println!("  {}", style(msg).blue()),
                GuideLine::Text(msg) => println!("  {}", msg),
                GuideLine::Hint(msg) => println!("  {}", style(msg).dim().italic()),
                GuideLine::Blank => println!(),
            }
        }
    }
}
