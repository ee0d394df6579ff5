extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Ident, Span};
use quote::{quote, quote_spanned};
use syn::{parse_macro_input, spanned::Spanned, ItemFn};

/// procedural macro to seamlessly declare interrupt handler wrappers
///
/// the generated trampoline pushes a dummy error code when the CPU doesn't
/// push one (`x86`) or leaves the CPU's own in place (`x86_error_code`),
/// saves every general and segment register, switches to the kernel data
/// segment, and hands the handler a pointer to the saved register block so
/// the handler can read or rewrite the interrupted context in place
#[proc_macro_attribute]
pub fn interrupt(metadata: TokenStream, input: TokenStream) -> TokenStream {
    let kind = parse_macro_input!(metadata as Ident);
    let input = parse_macro_input!(input as ItemFn);

    // make sure function's signature is ok
    if input.sig.unsafety.is_none() {
        return TokenStream::from(quote_spanned! {
            input.sig.span() => compile_error!("interrupt handlers must be unsafe");
        });
    }

    if !matches!(input.sig.output, syn::ReturnType::Default) {
        return TokenStream::from(quote_spanned! {
            input.sig.output.span() => compile_error!("interrupt handlers cannot return values");
        });
    }

    // whether the CPU pushes an error code for this vector; when it doesn't,
    // the trampoline pushes a 0 so the register block always has the same shape
    let push_dummy = match &*kind.to_string() {
        "x86" => true,
        "x86_error_code" => false,
        _ => {
            return TokenStream::from(quote_spanned! {
                kind.span() => compile_error!("unsupported interrupt kind");
            })
        }
    };

    let name = &input.sig.ident;
    let internal_name = Ident::new(&format!("__internal__{}__", name), Span::call_site());
    let call_asm = format!("call {}", internal_name);
    let inputs = &input.sig.inputs;
    let block = &input.block;

    let dummy_error_code = if push_dummy {
        quote! { "push 0", }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[unsafe(naked)]
        pub extern "C" fn #name() -> ! {
            ::core::arch::naked_asm!(
                #dummy_error_code

                "pusha",

                "mov ax, ds", // push data segment selector
                "push eax",

                "mov ax, 0x10", // switch to kernel's data segment
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",

                "push esp", // pushing a pointer to the registers instead of just interacting with the stored registers on the stack directly prevents many reads or writes from being optimized out

                #call_asm,

                "add esp, 4",

                "pop ebx", // switch back to the old data segment
                "mov ds, bx",
                "mov es, bx",
                "mov fs, bx",
                "mov gs, bx",

                "popa",

                "add esp, 4", // clean up error code

                "iretd",
            );
        }

        #[no_mangle]
        unsafe extern "C" fn #internal_name(#inputs) {
            #block
        }
    })
}
