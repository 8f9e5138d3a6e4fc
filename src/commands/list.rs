//! List commands implementation

use c0flash_device::available_backends;

/// List all backends compiled into this binary
pub fn list_backends() {
    println!("Available backends:");
    println!();
    for backend in available_backends() {
        let aliases = if backend.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", backend.aliases.join(", "))
        };
        println!("  {:<8} - {}{}", backend.name, backend.description, aliases);
    }
    println!();
    println!("A bare device path (e.g. /dev/sdb) is shorthand for raw:dev=PATH.");
}
