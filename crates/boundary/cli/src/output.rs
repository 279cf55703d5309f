use colored::Colorize;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

pub fn print_failure(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

pub fn print_header(title: &str) {
    println!("\n{}", title.bold().underline());
}
